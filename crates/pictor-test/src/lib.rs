//! Helpers for testing the fetch coordination engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - [`TestFetcher::hold`] parks transfers for a resource until the returned
//!    gate is released. Keep the gate in a variable and release it, or the
//!    transfer never finishes and the test hangs on its handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use pictor_service::{
    CacheStore, CachedPayload, DataOrigin, FetchError, FetchRequest, ProgressSink, ProgressUpdate,
    ResourceFetcher,
};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the
///    `pictor-service` crate and mutes everything else.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("pictor_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Gate parking scripted transfers until they are let through.
#[derive(Clone)]
pub struct FetchGate(Arc<Semaphore>);

impl FetchGate {
    fn new() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    /// Lets one held transfer proceed.
    pub fn release(&self) {
        self.0.add_permits(1);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.0.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Clone)]
struct Script {
    chunks: Vec<Bytes>,
    result: Result<Bytes, FetchError>,
    gate: Option<FetchGate>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            result: Err(FetchError::NotFound),
            gate: None,
        }
    }
}

/// A scripted fetcher.
///
/// Responses are keyed by resource identifier; unscripted resources fail with
/// [`FetchError::NotFound`]. Transfer starts and cancellations (futures
/// dropped before finishing) are counted for assertions.
#[derive(Default)]
pub struct TestFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    starts: AtomicUsize,
    cancellations: AtomicUsize,
}

impl TestFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `data` for `resource`.
    pub fn serve(&self, resource: &str, data: impl Into<Bytes>) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(resource.to_owned()).or_default();
        script.chunks = Vec::new();
        script.result = Ok(data.into());
    }

    /// Serves `chunks` as progressive slices; the final payload is their
    /// concatenation.
    pub fn serve_chunked(&self, resource: &str, chunks: Vec<Bytes>) {
        let full: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(resource.to_owned()).or_default();
        script.chunks = chunks;
        script.result = Ok(full.into());
    }

    /// Fails transfers for `resource` with `error`.
    pub fn fail(&self, resource: &str, error: FetchError) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(resource.to_owned()).or_default();
        script.chunks = Vec::new();
        script.result = Err(error);
    }

    /// Parks transfers for `resource` until the returned gate is released.
    /// One release lets one transfer through.
    pub fn hold(&self, resource: &str) -> FetchGate {
        let gate = FetchGate::new();
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(resource.to_owned()).or_default().gate = Some(gate.clone());
        gate
    }

    /// Number of transfers started.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of transfers dropped before they finished.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

struct CancelGuard<'a> {
    counter: &'a AtomicUsize,
    finished: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ResourceFetcher for TestFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressSink,
    ) -> Result<Bytes, FetchError> {
        self.starts.fetch_add(1, Ordering::SeqCst);

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(request.resource.as_str())
            .cloned()
            .unwrap_or_default();

        let mut guard = CancelGuard {
            counter: &self.cancellations,
            finished: false,
        };

        if let Some(gate) = &script.gate {
            gate.pass().await;
        }

        if request.progressive {
            let total = script.result.as_ref().ok().map(|data| data.len() as u64);
            let mut received = 0;
            for chunk in &script.chunks {
                received += chunk.len() as u64;
                progress.report(ProgressUpdate {
                    received,
                    total,
                    chunk: chunk.clone(),
                });
            }
        }

        guard.finished = true;
        script.result
    }
}

/// A two-tier cache store over plain hash maps, for observing what the
/// coordinator reads and writes.
#[derive(Default)]
pub struct TestCache {
    memory: Mutex<HashMap<String, Bytes>>,
    disk: Mutex<HashMap<String, Bytes>>,
}

impl TestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_memory(&self, key: &str, data: impl Into<Bytes>) {
        self.memory.lock().unwrap().insert(key.to_owned(), data.into());
    }

    pub fn seed_disk(&self, key: &str, data: impl Into<Bytes>) {
        self.disk.lock().unwrap().insert(key.to_owned(), data.into());
    }

    pub fn memory_entry(&self, key: &str) -> Option<Bytes> {
        self.memory.lock().unwrap().get(key).cloned()
    }

    pub fn disk_entry(&self, key: &str) -> Option<Bytes> {
        self.disk.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl CacheStore for TestCache {
    async fn get(&self, key: &str, memory_only: bool) -> Option<CachedPayload> {
        if let Some(data) = self.memory.lock().unwrap().get(key).cloned() {
            return Some(CachedPayload {
                data,
                origin: DataOrigin::Memory,
            });
        }
        if memory_only {
            return None;
        }
        self.disk
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .map(|data| CachedPayload {
                data,
                origin: DataOrigin::Disk,
            })
    }

    async fn put(&self, key: &str, data: Bytes, memory_only: bool) {
        self.memory
            .lock()
            .unwrap()
            .insert(key.to_owned(), data.clone());
        if !memory_only {
            self.disk.lock().unwrap().insert(key.to_owned(), data);
        }
    }

    async fn contains(&self, key: &str) -> bool {
        self.memory.lock().unwrap().contains_key(key) || self.disk.lock().unwrap().contains_key(key)
    }

    async fn exists_on_disk(&self, key: &str) -> bool {
        self.disk.lock().unwrap().contains_key(key)
    }
}
