//! Fetching of remote resources over the network.
//!
//! The coordinator consumes transfers through the [`ResourceFetcher`] seam;
//! [`HttpFetcher`] is the bundled implementation for HTTP(S) sources.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::FetchError;
use crate::options::LoadOptions;
use crate::registry::OperationRegistry;
use crate::types::{FetchPriority, ProgressUpdate, ResourceId};

mod http;

pub use self::http::HttpFetcher;

pub(crate) const USER_AGENT: &str = concat!("pictor/", env!("CARGO_PKG_VERSION"));

/// Transport-relevant parameters for one transfer, derived from the creating
/// request's options.
///
/// The coordinator does not interpret the transport flags; it records and
/// forwards them. A fetcher is free to ignore hints that have no meaning for
/// its transport.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub resource: ResourceId,
    /// Scheduling hint relative to other transfers.
    pub priority: FetchPriority,
    /// Whether partial payloads should be reported through the progress sink.
    pub progressive: bool,
    /// Whether the transfer should send and store cookies.
    pub handle_cookies: bool,
    /// Whether untrusted TLS certificates are acceptable.
    pub allow_insecure: bool,
    /// Whether the transfer should outlive the application's foreground time.
    pub continue_in_background: bool,
}

impl FetchRequest {
    pub(crate) fn new(resource: ResourceId, options: LoadOptions) -> Self {
        Self {
            resource,
            priority: options.priority(),
            progressive: options.contains(LoadOptions::PROGRESSIVE),
            handle_cookies: options.contains(LoadOptions::HANDLE_COOKIES),
            allow_insecure: options.contains(LoadOptions::ALLOW_INSECURE),
            continue_in_background: options.contains(LoadOptions::CONTINUE_IN_BACKGROUND),
        }
    }
}

/// Sink for non-terminal transfer data.
///
/// Reports fan out to every caller that requested progressive delivery.
/// Reporting through a disabled sink is a no-op, so fetchers can report
/// unconditionally.
///
/// Reports must come from the transfer task itself, in non-decreasing
/// `received` order.
pub struct ProgressSink {
    target: Option<(Arc<OperationRegistry>, String)>,
}

impl ProgressSink {
    pub(crate) fn attached(registry: Arc<OperationRegistry>, key: String) -> Self {
        Self {
            target: Some((registry, key)),
        }
    }

    /// A sink that discards all reports, for transfers without progressive
    /// delivery.
    pub fn disabled() -> Self {
        Self { target: None }
    }

    /// Whether anything listens to this sink.
    pub fn enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Reports a non-terminal slice of the transfer.
    pub fn report(&self, update: ProgressUpdate) {
        if let Some((registry, key)) = &self.target {
            registry.report_progress(key, update);
        }
    }
}

/// A source of remote resources.
///
/// One call per operation: concurrent requests for the same resource are
/// coalesced before a fetcher ever sees them. When every interested caller
/// detaches, the returned future is dropped; transfers need no explicit
/// cancellation path, and partially received bytes are simply discarded.
#[async_trait]
pub trait ResourceFetcher: Send + Sync + 'static {
    /// Transfers the resource, reporting chunks through `progress` when
    /// `request.progressive` is set.
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressSink,
    ) -> Result<Bytes, FetchError>;
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        let mut source: &dyn Error = &error;
        while let Some(inner) = source.source() {
            source = inner;
        }

        let mut error_string = source.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::Network(error_string)
    }
}

/// Try to run a future up to 3 times with 20 millisecond delays on failure.
///
/// Only used while establishing a transfer; once body bytes have been
/// streamed, errors are final.
pub(crate) async fn retry<G, F, T>(task_gen: G) -> Result<T, FetchError>
where
    G: Fn() -> F,
    F: Future<Output = Result<T, FetchError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        // its highly unlikely we get a different result when retrying these
        let should_not_retry = matches!(
            result,
            Ok(_) | Err(FetchError::NotFound | FetchError::PermissionDenied(_))
        );

        if should_not_retry || tries >= 3 {
            break result;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_retry_counts() {
        let tries = AtomicUsize::new(0);
        let result: Result<(), _> = retry(|| async {
            tries.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Network("connection reset".into()))
        })
        .await;

        assert!(matches!(result, Err(FetchError::Network(_))));
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_not_found() {
        let tries = AtomicUsize::new(0);
        let result: Result<(), _> = retry(|| async {
            tries.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::NotFound)
        })
        .await;

        assert!(matches!(result, Err(FetchError::NotFound)));
        assert_eq!(tries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_from_options() {
        let options = LoadOptions::PROGRESSIVE | LoadOptions::ALLOW_INSECURE | LoadOptions::HIGH_PRIORITY;
        let request = FetchRequest::new(ResourceId::from("img://a"), options);

        assert!(request.progressive);
        assert!(request.allow_insecure);
        assert!(!request.handle_cookies);
        assert_eq!(request.priority, FetchPriority::High);
    }
}
