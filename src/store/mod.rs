//! Counter storage backends.
//!
//! A counter store maps keys to point counters that expire on their own.
//! Every operation is atomic per key; callers on different processes can share
//! one store as long as the backend itself is shared (Redis).
//!
//! - **Redis**: distributed, the production backend
//! - **Memory**: single process, used for development, the CLI and tests

mod memory;
mod redis;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};

/// Errors raised by a counter store.
///
/// These are infrastructure faults, never policy outcomes: a blocked key is a
/// regular [`Counter`] whose point count is over the limit.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{backend} counter store unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("{backend} counter store call timed out after {timeout_ms}ms")]
    Timeout { backend: &'static str, timeout_ms: u64 },
}

impl StoreError {
    pub fn unavailable(backend: &'static str, reason: impl ToString) -> Self {
        StoreError::Unavailable {
            backend,
            reason: reason.to_string(),
        }
    }

    /// Name of the backend that failed.
    pub fn backend(&self) -> &'static str {
        match self {
            StoreError::Unavailable { backend, .. } | StoreError::Timeout { backend, .. } => {
                backend
            }
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Snapshot of a counter as seen by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Points consumed since the counter was created
    pub points: u64,
    /// Time left before the counter expires
    pub ttl: Duration,
}

/// Trait for counter storage backends.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `points` to the counter at `key` and return its new state.
    ///
    /// A missing or expired counter is created with `ttl`. An existing counter
    /// keeps its expiry.
    async fn consume(&self, key: &str, points: u64, ttl: Duration) -> StoreResult<Counter>;

    /// Read the counter at `key` without modifying it.
    async fn get(&self, key: &str) -> StoreResult<Option<Counter>>;

    /// Delete the counter at `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Replace the expiry of an existing counter, keeping its points.
    ///
    /// Returns `None` when there is no live counter at `key`.
    async fn block(&self, key: &str, ttl: Duration) -> StoreResult<Option<Counter>>;

    /// Backend name for logs and errors.
    fn backend_name(&self) -> &'static str;
}

/// Open the counter store selected by `config`.
pub async fn connect(config: &StoreConfig) -> StoreResult<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            if config.purge_interval_secs > 0 {
                store.spawn_purge(Duration::from_secs(config.purge_interval_secs));
            }
            store
        }
        StoreBackend::Redis => Arc::new(RedisCounterStore::connect(&config.redis_url).await?),
    };
    info!(backend = store.backend_name(), "Counter store ready");
    Ok(store)
}
