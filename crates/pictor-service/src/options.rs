use bitflags::bitflags;

use crate::types::FetchPriority;

bitflags! {
    /// Per-request behavior flags.
    ///
    /// Flags are orthogonal; any combination is valid input. Flags that only
    /// concern the transport (cookies, TLS trust, background continuation)
    /// are recorded here and forwarded to the fetcher unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadOptions: u32 {
        /// Attempt the fetch even if a previous attempt for the same resource
        /// permanently failed. Clears the resource's failure record.
        const RETRY_FAILED = 1 << 0;
        /// Hint the fetcher to schedule this transfer behind others.
        const LOW_PRIORITY = 1 << 1;
        /// Keep the result out of the disk tier, and skip probing it.
        const MEMORY_ONLY = 1 << 2;
        /// Deliver partial payloads while the transfer runs.
        const PROGRESSIVE = 1 << 3;
        /// Deliver a cached payload as stale, then refresh it from the
        /// network and deliver the fresh payload as the terminal event.
        const FORCE_REVALIDATE = 1 << 4;
        /// Ask the fetcher to keep the transfer alive while the application
        /// is backgrounded.
        const CONTINUE_IN_BACKGROUND = 1 << 5;
        /// Ask the fetcher to send and store cookies for this transfer.
        const HANDLE_COOKIES = 1 << 6;
        /// Allow the fetcher to accept untrusted TLS certificates.
        const ALLOW_INSECURE = 1 << 7;
        /// Hint the fetcher to schedule this transfer ahead of others. Also
        /// moves the caller to the front of the delivery order.
        const HIGH_PRIORITY = 1 << 8;
        /// UI hint carried through to the caller: delay placeholder rendering
        /// until the transfer finished.
        const DEFER_PLACEHOLDER = 1 << 9;
        /// Run the transform hook on animated payloads too.
        const TRANSFORM_ANIMATED = 1 << 10;
        /// UI hint carried through to the caller: do not apply the result
        /// automatically.
        const MANUAL_APPLY = 1 << 11;
    }
}

impl LoadOptions {
    /// The scheduling hint derived from the priority flags.
    ///
    /// [`HIGH_PRIORITY`](Self::HIGH_PRIORITY) wins when both priority flags
    /// are set.
    pub fn priority(self) -> FetchPriority {
        if self.contains(Self::HIGH_PRIORITY) {
            FetchPriority::High
        } else if self.contains(Self::LOW_PRIORITY) {
            FetchPriority::Low
        } else {
            FetchPriority::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_derivation() {
        assert_eq!(LoadOptions::empty().priority(), FetchPriority::Normal);
        assert_eq!(LoadOptions::LOW_PRIORITY.priority(), FetchPriority::Low);
        assert_eq!(LoadOptions::HIGH_PRIORITY.priority(), FetchPriority::High);
        assert_eq!(
            (LoadOptions::HIGH_PRIORITY | LoadOptions::LOW_PRIORITY).priority(),
            FetchPriority::High
        );
    }

    #[test]
    fn test_flags_are_independent() {
        let all = LoadOptions::all();
        assert_eq!(all.bits().count_ones(), 12);
        assert!(all.contains(LoadOptions::RETRY_FAILED | LoadOptions::MANUAL_APPLY));
    }
}
