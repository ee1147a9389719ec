use std::time::Duration;

use thiserror::Error;

/// An error that terminates a load request.
///
/// Every request resolves through its event channel with either a payload or
/// one of these kinds; the coordinator never propagates errors across its own
/// boundary in any other way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The resource was not found at the remote source.
    #[error("not found")]
    NotFound,
    /// The remote source refused to serve the resource.
    ///
    /// The attached string contains the remote source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The transfer did not finish within the configured time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The transfer failed for another transport-level reason, like
    /// connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the underlying cause.
    #[error("fetch failed: {0}")]
    Network(String),
    /// A previous fetch for this resource permanently failed, and the request
    /// did not carry [`RETRY_FAILED`](crate::LoadOptions::RETRY_FAILED).
    ///
    /// Served from the failure ledger with no network attempt.
    #[error("previously failed")]
    PreviouslyFailed,
    /// The configured policy hook declined the fetch.
    #[error("rejected by policy")]
    RejectedByPolicy,
    /// Every interested caller detached before the transfer finished, or the
    /// request was cancelled wholesale.
    #[error("cancelled")]
    Cancelled,
    /// The payload was fetched but is unusable, for example because the
    /// transform hook failed on it.
    #[error("malformed: {0}")]
    Malformed(String),
}

impl FetchError {
    /// `true` for the cancellation acknowledgement kind.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }

    /// Whether this failure is recorded in the failure ledger.
    ///
    /// Cancellations and ledger/policy verdicts never are; timeouts only when
    /// the configuration says transient failures should be remembered.
    pub(crate) fn should_remember(&self, remember_transient: bool) -> bool {
        match self {
            FetchError::NotFound
            | FetchError::PermissionDenied(_)
            | FetchError::Network(_)
            | FetchError::Malformed(_) => true,
            FetchError::Timeout(_) => remember_transient,
            FetchError::PreviouslyFailed
            | FetchError::RejectedByPolicy
            | FetchError::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_classification() {
        assert!(FetchError::NotFound.should_remember(false));
        assert!(FetchError::Network("reset".into()).should_remember(false));
        assert!(FetchError::Malformed("bad".into()).should_remember(false));

        let timeout = FetchError::Timeout(Duration::from_secs(1));
        assert!(timeout.should_remember(true));
        assert!(!timeout.should_remember(false));

        assert!(!FetchError::Cancelled.should_remember(true));
        assert!(!FetchError::PreviouslyFailed.should_remember(true));
        assert!(!FetchError::RejectedByPolicy.should_remember(true));
    }
}
