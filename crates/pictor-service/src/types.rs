use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use crate::error::FetchError;

/// Opaque locator for a remote resource, as supplied by the caller.
///
/// Equality is structural on the canonical string form. The coordinator never
/// interprets the identifier itself; it only derives a cache key from it and
/// hands it to the configured fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Arc<str>);

impl ResourceId {
    pub fn new(uri: impl Into<Arc<str>>) -> Self {
        Self(uri.into())
    }

    /// The canonical string form of the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for ResourceId {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

impl From<Url> for ResourceId {
    fn from(url: Url) -> Self {
        Self::new(String::from(url))
    }
}

/// Where a delivered payload was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    /// The memory tier of the cache store.
    Memory,
    /// The disk tier of the cache store.
    Disk,
    /// A fresh network transfer.
    Network,
}

/// A binary payload plus the tier it was served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePayload {
    pub data: Bytes,
    pub origin: DataOrigin,
}

impl ResourcePayload {
    pub fn new(data: Bytes, origin: DataOrigin) -> Self {
        Self { data, origin }
    }
}

/// A non-terminal slice of an in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Bytes received so far, including `chunk`. Non-decreasing within one
    /// transfer.
    pub received: u64,
    /// Total size, if the transport announced one.
    pub total: Option<u64>,
    /// The newly received chunk.
    pub chunk: Bytes,
}

/// Events delivered to one caller: progress first, terminal event last.
///
/// A caller receives zero or more non-terminal events followed by exactly one
/// [`LoadEvent::Done`], unless it detaches first, in which case delivery stops
/// entirely.
#[derive(Debug, Clone)]
pub enum LoadEvent {
    /// Progressive transfer data; only sent to callers that requested
    /// [`PROGRESSIVE`](crate::LoadOptions::PROGRESSIVE) on an operation that
    /// was started with progressive reporting.
    Progress(ProgressUpdate),
    /// The cached payload, delivered ahead of a forced revalidation.
    Stale(ResourcePayload),
    /// The terminal event.
    Done(Result<ResourcePayload, FetchError>),
}

/// Scheduling hint forwarded to the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// Cheap signature check for animated payloads (GIF and animated WebP).
///
/// The transform hook is skipped for these unless explicitly requested, since
/// most transforms mangle animations.
pub(crate) fn is_animated(data: &[u8]) -> bool {
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return true;
    }

    // RIFF container with a VP8X header whose animation bit is set.
    data.len() > 20
        && &data[0..4] == b"RIFF"
        && &data[8..12] == b"WEBP"
        && &data[12..16] == b"VP8X"
        && data[20] & 0x02 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_equality() {
        let a = ResourceId::from("img://a");
        let b = ResourceId::from(String::from("img://a"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "img://a");
    }

    #[test]
    fn test_animated_sniff() {
        assert!(is_animated(b"GIF89a-rest-of-image"));
        assert!(is_animated(b"GIF87a"));
        assert!(!is_animated(b"\x89PNG\r\n\x1a\n"));
        assert!(!is_animated(b""));

        let mut webp = Vec::new();
        webp.extend_from_slice(b"RIFF\x00\x00\x00\x00WEBPVP8X\x0a\x00\x00\x00");
        webp.push(0x02); // animation flag
        webp.extend_from_slice(&[0; 8]);
        assert!(is_animated(&webp));

        webp[20] = 0x00;
        assert!(!is_animated(&webp));
    }
}
