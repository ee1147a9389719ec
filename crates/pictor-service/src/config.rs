use std::time::Duration;

use serde::Deserialize;

/// Timeouts applied by the bundled HTTP fetcher.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FetchTimeouts {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// The timeout for receiving response headers.
    #[serde(with = "humantime_serde")]
    pub head: Duration,
    /// Global timeout for one transfer.
    #[serde(with = "humantime_serde")]
    pub max_fetch: Duration,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            head: Duration::from_secs(5),
            max_fetch: Duration::from_secs(315),
        }
    }
}

/// Configuration for a [`Manager`](crate::Manager).
///
/// All fields have defaults, so an empty document deserializes into a working
/// configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum total payload bytes held by the bundled in-memory cache store.
    ///
    /// Only consulted when no external [`CacheStore`](crate::CacheStore) is
    /// configured.
    pub in_memory_capacity: u64,
    /// Whether transient failures (timeouts) populate the failure ledger.
    ///
    /// With the default of `true`, any failed resource stays failed for the
    /// process lifetime until a request carries
    /// [`RETRY_FAILED`](crate::LoadOptions::RETRY_FAILED). Set to `false` to
    /// let timed-out resources be retried on the next request.
    pub remember_transient_failures: bool,
    /// Timeouts for the bundled HTTP fetcher.
    pub timeouts: FetchTimeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            in_memory_capacity: 128 * 1024 * 1024,
            remember_transient_failures: true,
            timeouts: FetchTimeouts::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.remember_transient_failures);
        assert_eq!(config.timeouts.connect, Duration::from_millis(500));
    }

    #[test]
    fn test_humantime_durations() {
        let config: Config = serde_json::from_str(
            r#"{
                "in_memory_capacity": 1024,
                "remember_transient_failures": false,
                "timeouts": { "connect": "1s", "head": "10s", "max_fetch": "2m" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.in_memory_capacity, 1024);
        assert!(!config.remember_transient_failures);
        assert_eq!(config.timeouts.max_fetch, Duration::from_secs(120));
    }
}
