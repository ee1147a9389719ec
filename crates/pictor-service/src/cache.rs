use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::{DataOrigin, ResourceId};

/// Maps a resource identifier to a cache key, normalizing away volatile parts
/// (query parameters, signatures) before the key is used for lookup and
/// deduplication.
///
/// Returning `None` selects the identifier's raw string form, so key
/// computation can never fail a request.
pub type CacheKeyFilter = Arc<dyn Fn(&ResourceId) -> Option<String> + Send + Sync>;

/// Derives the cache key for `resource`.
///
/// This is a pure function of the identifier and the filter configuration:
/// the same inputs always produce the same key within a process run.
pub(crate) fn resolve_cache_key(resource: &ResourceId, filter: Option<&CacheKeyFilter>) -> String {
    match filter {
        Some(filter) => {
            filter(resource).unwrap_or_else(|| resource.as_str().to_owned())
        }
        None => resource.as_str().to_owned(),
    }
}

/// A payload served from the cache store, tagged with its tier.
#[derive(Debug, Clone)]
pub struct CachedPayload {
    pub data: Bytes,
    /// [`DataOrigin::Memory`] or [`DataOrigin::Disk`].
    pub origin: DataOrigin,
}

/// External cache storage, consumed through a narrow seam.
///
/// The coordinator only issues read and write calls; tier layout, eviction,
/// and on-disk serialization are entirely the store's business. Stores must
/// tolerate concurrent access.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Looks up `key`, memory tier first, then disk unless `memory_only` is
    /// set.
    async fn get(&self, key: &str, memory_only: bool) -> Option<CachedPayload>;

    /// Stores a payload under `key`. `memory_only` keeps it out of the disk
    /// tier.
    async fn put(&self, key: &str, data: Bytes, memory_only: bool);

    /// Whether any tier holds `key`.
    async fn contains(&self, key: &str) -> bool;

    /// Whether the disk tier holds `key`.
    async fn exists_on_disk(&self, key: &str) -> bool;
}

/// Bundled memory-only cache store.
///
/// Entries are weighed by payload size and evicted by total byte capacity.
/// There is no disk tier; `memory_only` is accepted and ignored on writes.
#[derive(Debug)]
pub struct MemoryCache {
    entries: moka::future::Cache<String, Bytes>,
}

impl MemoryCache {
    /// Creates a store holding at most `capacity` payload bytes.
    pub fn new(capacity: u64) -> Self {
        let entries = moka::future::Cache::builder()
            .max_capacity(capacity)
            .weigher(|key: &String, data: &Bytes| {
                (key.len() + data.len()).min(u32::MAX as usize) as u32
            })
            .build();

        Self { entries }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str, _memory_only: bool) -> Option<CachedPayload> {
        let data = self.entries.get(key).await?;
        Some(CachedPayload {
            data,
            origin: DataOrigin::Memory,
        })
    }

    async fn put(&self, key: &str, data: Bytes, _memory_only: bool) {
        self.entries.insert(key.to_owned(), data).await;
    }

    async fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    async fn exists_on_disk(&self, _key: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_key_is_identifier() {
        let resource = ResourceId::from("https://example.com/a.png?sig=123");
        assert_eq!(
            resolve_cache_key(&resource, None),
            "https://example.com/a.png?sig=123"
        );
    }

    #[test]
    fn test_filter_replaces_default() {
        let filter: CacheKeyFilter = Arc::new(|resource: &ResourceId| {
            resource.as_str().split('?').next().map(str::to_owned)
        });

        let resource = ResourceId::from("https://example.com/a.png?sig=123");
        assert_eq!(
            resolve_cache_key(&resource, Some(&filter)),
            "https://example.com/a.png"
        );
    }

    #[test]
    fn test_declining_filter_falls_back_to_raw_form() {
        let filter: CacheKeyFilter = Arc::new(|_: &ResourceId| None);

        let resource = ResourceId::from("img://a");
        assert_eq!(resolve_cache_key(&resource, Some(&filter)), "img://a");
    }

    #[tokio::test]
    async fn test_memory_cache_round_trip() {
        let cache = MemoryCache::new(1024 * 1024);

        assert!(cache.get("key", false).await.is_none());

        cache.put("key", Bytes::from_static(b"payload"), false).await;

        let cached = cache.get("key", false).await.unwrap();
        assert_eq!(cached.data.as_ref(), b"payload");
        assert_eq!(cached.origin, DataOrigin::Memory);

        assert!(cache.contains("key").await);
        assert!(!cache.exists_on_disk("key").await);
    }
}
