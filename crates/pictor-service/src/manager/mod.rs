//! The coordination engine tying cache, ledger, registry, and fetcher
//! together.
//!
//! A load request goes through the following steps:
//! - The resource identifier is resolved into a cache key.
//! - The cache store is probed, memory tier first. A hit settles the request
//!   immediately, unless a forced revalidation delivers the hit as stale and
//!   continues.
//! - The failure ledger is consulted; previously failed resources terminate
//!   with no network attempt unless the request carries the retry flag.
//! - The optional policy hook gets to decline the fetch.
//! - The request joins the in-flight operation for its key, or creates one.
//!   Creation spawns a transfer driver; concurrent requests for the same key
//!   share one transfer.
//! - On success the payload is transformed (optional hook), written back into
//!   the cache, and fanned out; on failure the ledger is updated and the
//!   failure fanned out.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::cache::{resolve_cache_key, CacheKeyFilter, CacheStore, MemoryCache};
use crate::config::Config;
use crate::download::{FetchRequest, HttpFetcher, ProgressSink, ResourceFetcher};
use crate::error::FetchError;
use crate::ledger::FailureLedger;
use crate::options::LoadOptions;
use crate::registry::{Joined, JoinRequest, LoadHandle, OperationRegistry};
use crate::types::{is_animated, DataOrigin, LoadEvent, ResourceId, ResourcePayload};

/// Gate consulted before any fetch starts.
///
/// Implemented for plain closures; an absent hook means every fetch is
/// allowed.
pub trait FetchPolicy: Send + Sync + 'static {
    /// `false` rejects the request with
    /// [`RejectedByPolicy`](FetchError::RejectedByPolicy).
    fn should_fetch(&self, resource: &ResourceId) -> bool;
}

impl<F> FetchPolicy for F
where
    F: Fn(&ResourceId) -> bool + Send + Sync + 'static,
{
    fn should_fetch(&self, resource: &ResourceId) -> bool {
        self(resource)
    }
}

/// Reshapes a fetched payload before it is cached and delivered.
///
/// Runs on a blocking worker, never on the delivery path. Animated payloads
/// are passed through untransformed unless the request carries
/// [`TRANSFORM_ANIMATED`](LoadOptions::TRANSFORM_ANIMATED).
pub trait PayloadTransform: Send + Sync + 'static {
    fn transform(&self, data: Bytes, resource: &ResourceId) -> anyhow::Result<Bytes>;
}

impl<F> PayloadTransform for F
where
    F: Fn(Bytes, &ResourceId) -> anyhow::Result<Bytes> + Send + Sync + 'static,
{
    fn transform(&self, data: Bytes, resource: &ResourceId) -> anyhow::Result<Bytes> {
        self(data, resource)
    }
}

/// Builder for a [`Manager`] with non-default collaborators.
#[derive(Default)]
pub struct ManagerBuilder {
    config: Config,
    fetcher: Option<Arc<dyn ResourceFetcher>>,
    cache: Option<Arc<dyn CacheStore>>,
    policy: Option<Arc<dyn FetchPolicy>>,
    transform: Option<Arc<dyn PayloadTransform>>,
}

impl ManagerBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replaces the bundled [`HttpFetcher`].
    pub fn fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replaces the bundled [`MemoryCache`].
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn FetchPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn build(self) -> Manager {
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpFetcher::new(self.config.timeouts)));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new(self.config.in_memory_capacity)));

        Manager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                fetcher,
                cache,
                registry: Arc::new(OperationRegistry::new()),
                ledger: FailureLedger::new(),
                key_filter: Mutex::new(None),
                policy: self.policy,
                transform: self.transform,
            }),
        }
    }
}

/// The public entry point for coordinated resource loads.
///
/// Cheap to clone; clones share all state. Construct private instances
/// through [`Manager::builder`], or use the process-scoped default via
/// [`Manager::shared`] so deduplication works across call sites.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Config,
    fetcher: Arc<dyn ResourceFetcher>,
    cache: Arc<dyn CacheStore>,
    registry: Arc<OperationRegistry>,
    ledger: FailureLedger,
    key_filter: Mutex<Option<CacheKeyFilter>>,
    policy: Option<Arc<dyn FetchPolicy>>,
    transform: Option<Arc<dyn PayloadTransform>>,
}

static SHARED: OnceCell<Manager> = OnceCell::new();

impl Manager {
    /// A manager with default collaborators and configuration.
    pub fn new(config: Config) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    /// The process-scoped default instance, created on first use with default
    /// collaborators.
    pub fn shared() -> &'static Manager {
        SHARED.get_or_init(|| Self::builder().build())
    }

    /// The cache key for `resource` under the configured filter.
    pub fn cache_key(&self, resource: &ResourceId) -> String {
        let filter = self.inner.key_filter.lock().unwrap();
        resolve_cache_key(resource, filter.as_ref())
    }

    /// Installs or removes the cache-key filter.
    ///
    /// Affects subsequent loads only; in-flight operations keep the key they
    /// were created under.
    pub fn set_cache_key_filter(&self, filter: Option<CacheKeyFilter>) {
        *self.inner.key_filter.lock().unwrap() = filter;
    }

    /// Loads a resource, returning a handle delivering its events.
    ///
    /// Concurrent loads for the same cache key share one transfer; every
    /// caller receives its own terminal event.
    pub async fn load(&self, resource: impl Into<ResourceId>, options: LoadOptions) -> LoadHandle {
        let resource = resource.into();
        let key = self.cache_key(&resource);
        let inner = &self.inner;

        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();

        // Cache probe. A hit settles the request immediately, unless a
        // revalidation was requested, in which case it is delivered as stale
        // and the fetch proceeds.
        let memory_only = options.contains(LoadOptions::MEMORY_ONLY);
        let mut stale = None;
        if let Some(cached) = inner.cache.get(&key, memory_only).await {
            let payload = ResourcePayload::new(cached.data, cached.origin);
            if options.contains(LoadOptions::FORCE_REVALIDATE) {
                stale = Some(payload);
            } else {
                tracing::trace!(%resource, origin = ?payload.origin, "Serving from cache");
                sender.send(LoadEvent::Done(Ok(payload))).ok();
                return LoadHandle::settled(receiver);
            }
        }

        // Failure ledger. Previously failed resources are not retried unless
        // the caller asks; asking clears the record.
        if options.contains(LoadOptions::RETRY_FAILED) {
            inner.ledger.clear(&key);
        } else if inner.ledger.is_marked(&key) {
            tracing::trace!(%resource, "Resource previously failed, not retrying");
            if let Some(payload) = stale {
                sender.send(LoadEvent::Stale(payload)).ok();
            }
            sender
                .send(LoadEvent::Done(Err(FetchError::PreviouslyFailed)))
                .ok();
            return LoadHandle::settled(receiver);
        }

        // Policy gate.
        if !self.fetch_allowed(&resource).await {
            tracing::trace!(%resource, "Fetch rejected by policy");
            if let Some(payload) = stale {
                sender.send(LoadEvent::Stale(payload)).ok();
            }
            sender
                .send(LoadEvent::Done(Err(FetchError::RejectedByPolicy)))
                .ok();
            return LoadHandle::settled(receiver);
        }

        if let Some(payload) = stale {
            sender.send(LoadEvent::Stale(payload)).ok();
        }

        // Join the in-flight operation for this key, or create one and start
        // its transfer.
        let progressive = options.contains(LoadOptions::PROGRESSIVE);
        let join = JoinRequest {
            sender,
            wants_progress: progressive,
            high_priority: options.contains(LoadOptions::HIGH_PRIORITY),
        };
        let (caller, joined) = inner.registry.join_or_create(&key, join, progressive);

        if let Joined::Created(cancel) = joined {
            let request = FetchRequest::new(resource, options);
            tokio::spawn(drive_fetch(
                inner.clone(),
                key.clone(),
                request,
                options,
                cancel,
            ));
        }

        LoadHandle::attached(receiver, inner.registry.clone(), key, caller)
    }

    /// Inserts a payload into the cache without a fetch.
    pub async fn store(&self, resource: impl Into<ResourceId>, data: Bytes, memory_only: bool) {
        let key = self.cache_key(&resource.into());
        self.inner.cache.put(&key, data, memory_only).await;
    }

    /// Whether any cache tier holds the resource.
    pub async fn exists_in_cache(&self, resource: &ResourceId) -> bool {
        let key = self.cache_key(resource);
        self.inner.cache.contains(&key).await
    }

    /// Whether the disk tier holds the resource.
    pub async fn exists_on_disk(&self, resource: &ResourceId) -> bool {
        let key = self.cache_key(resource);
        self.inner.cache.exists_on_disk(&key).await
    }

    /// Whether any fetch operation is in flight.
    pub fn is_running(&self) -> bool {
        self.inner.registry.is_running()
    }

    /// Number of in-flight fetch operations.
    pub fn running_count(&self) -> usize {
        self.inner.registry.running_count()
    }

    /// Cancels every in-flight operation; each still-attached caller receives
    /// a terminal cancellation acknowledgement.
    pub fn cancel_all(&self) {
        self.inner.registry.cancel_all();
    }

    /// Forgets all recorded failures.
    pub fn reset_failures(&self) {
        self.inner.ledger.clear_all();
    }

    async fn fetch_allowed(&self, resource: &ResourceId) -> bool {
        let Some(policy) = self.inner.policy.clone() else {
            return true;
        };

        let resource = resource.clone();
        tokio::task::spawn_blocking(move || policy.should_fetch(&resource))
            .await
            .unwrap_or(true)
    }
}

/// Runs one transfer to completion, racing it against cancellation, and
/// settles the operation.
async fn drive_fetch(
    inner: Arc<ManagerInner>,
    key: String,
    request: FetchRequest,
    options: LoadOptions,
    cancel: CancellationToken,
) {
    let progress = if request.progressive {
        ProgressSink::attached(inner.registry.clone(), key.clone())
    } else {
        ProgressSink::disabled()
    };

    tracing::debug!(resource = %request.resource, "Starting fetch");
    let resource = request.resource.clone();

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        result = inner.fetcher.fetch(request, progress) => result,
    };

    match result {
        Ok(data) => finish_success(&inner, &key, &resource, data, options).await,
        Err(err) if err.is_cancelled() => {
            // The last caller detached; the registry entry is already gone.
            tracing::debug!(%resource, "Fetch cancelled");
        }
        Err(err) => {
            tracing::debug!(%resource, error = %err, "Fetch failed");
            if err.should_remember(inner.config.remember_transient_failures) {
                inner.ledger.mark(&key);
            }
            inner.registry.complete(&key, Err(err));
        }
    }
}

async fn finish_success(
    inner: &Arc<ManagerInner>,
    key: &str,
    resource: &ResourceId,
    data: Bytes,
    options: LoadOptions,
) {
    let data = match apply_transform(inner, resource, data, options).await {
        Ok(data) => data,
        Err(err) => {
            // An unusable payload counts as a permanent failure.
            tracing::debug!(%resource, error = %err, "Transform failed");
            inner.ledger.mark(key);
            inner.registry.complete(key, Err(err));
            return;
        }
    };

    let memory_only = options.contains(LoadOptions::MEMORY_ONLY);
    inner.cache.put(key, data.clone(), memory_only).await;
    inner.ledger.clear(key);

    let payload = ResourcePayload::new(data, DataOrigin::Network);
    inner.registry.complete(key, Ok(payload));
}

async fn apply_transform(
    inner: &Arc<ManagerInner>,
    resource: &ResourceId,
    data: Bytes,
    options: LoadOptions,
) -> Result<Bytes, FetchError> {
    let Some(transform) = inner.transform.clone() else {
        return Ok(data);
    };

    if is_animated(&data) && !options.contains(LoadOptions::TRANSFORM_ANIMATED) {
        return Ok(data);
    }

    let resource = resource.clone();
    match tokio::task::spawn_blocking(move || transform.transform(data, &resource)).await {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(err)) => Err(FetchError::Malformed(err.to_string())),
        Err(_) => Err(FetchError::Malformed("transform hook panicked".into())),
    }
}
