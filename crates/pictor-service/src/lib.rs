//! Coordinated retrieval of remote binary resources.
//!
//! Pictor sits between client code and a pair of external collaborators, a
//! [`CacheStore`] and a [`ResourceFetcher`], and guarantees that concurrent
//! requests for the same resource share at most one outstanding transfer,
//! that permanently failed resources are not retried endlessly, and that
//! every interested caller receives its result exactly once, even under
//! cancellation.
//!
//! The entry point is [`Manager::load`], which returns a [`LoadHandle`]
//! delivering [`LoadEvent`]s: optional progress, an optional stale cached
//! payload ahead of a revalidation, and exactly one terminal event.

mod cache;
mod config;
pub mod download;
mod error;
mod ledger;
mod manager;
mod options;
mod registry;
mod types;

pub use cache::{CacheKeyFilter, CacheStore, CachedPayload, MemoryCache};
pub use config::{Config, FetchTimeouts};
pub use download::{FetchRequest, HttpFetcher, ProgressSink, ResourceFetcher};
pub use error::FetchError;
pub use ledger::FailureLedger;
pub use manager::{FetchPolicy, Manager, ManagerBuilder, PayloadTransform};
pub use options::LoadOptions;
pub use registry::LoadHandle;
pub use types::{
    DataOrigin, FetchPriority, LoadEvent, ProgressUpdate, ResourceId, ResourcePayload,
};
