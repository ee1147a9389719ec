use std::collections::HashSet;
use std::sync::Mutex;

/// Process-lifetime record of cache keys whose fetch permanently failed.
///
/// Membership blocks further fetch attempts for a key until a request carries
/// the retry flag or the ledger is reset. Records are never persisted across
/// restarts and never expire on their own.
#[derive(Debug, Default)]
pub struct FailureLedger {
    failed: Mutex<HashSet<String>>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fetch for `key` has previously failed.
    pub fn is_marked(&self, key: &str) -> bool {
        self.failed.lock().unwrap().contains(key)
    }

    /// Records `key` as failed. Marking an already-marked key is a no-op.
    pub fn mark(&self, key: &str) {
        self.failed.lock().unwrap().insert(key.to_owned());
    }

    /// Removes the record for `key`. Clearing an unmarked key is a no-op.
    pub fn clear(&self, key: &str) {
        self.failed.lock().unwrap().remove(key);
    }

    /// Removes all records.
    pub fn clear_all(&self) {
        self.failed.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_clear() {
        let ledger = FailureLedger::new();
        assert!(!ledger.is_marked("a"));

        ledger.mark("a");
        assert!(ledger.is_marked("a"));
        assert!(!ledger.is_marked("b"));

        ledger.clear("a");
        assert!(!ledger.is_marked("a"));
    }

    #[test]
    fn test_idempotence() {
        let ledger = FailureLedger::new();

        ledger.mark("a");
        ledger.mark("a");
        assert!(ledger.is_marked("a"));

        ledger.clear("a");
        ledger.clear("a");
        assert!(!ledger.is_marked("a"));

        // clearing a key that was never marked is fine too
        ledger.clear("never-seen");
    }

    #[test]
    fn test_clear_all() {
        let ledger = FailureLedger::new();
        ledger.mark("a");
        ledger.mark("b");

        ledger.clear_all();
        assert!(!ledger.is_marked("a"));
        assert!(!ledger.is_marked("b"));
    }
}
