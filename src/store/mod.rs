//! Counter store abstraction and backends.
//!
//! The counter store is the only shared mutable state of the engine. All
//! serialization between concurrent requests is delegated to its atomic
//! primitives; the engine itself takes no locks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::config::StorageConfig;
use crate::error::Result;

mod memory;
mod redis;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

/// Errors that can occur when talking to a counter store.
///
/// Every variant counts as a store failure for the configured failure mode.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// A store call did not complete in time.
    #[error("Counter store call timed out after {0:?}")]
    Timeout(Duration),

    /// An increment hit a value that is not an integer.
    #[error("Stored value is not an integer")]
    NotAnInteger,

    /// Any other backend failure.
    #[error("Counter store backend error: {0}")]
    Backend(String),
}

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key/value store with TTLs and atomic increments, shared by all serving
/// processes.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Get the value at `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Overwrite the value at `key` and replace its TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically add `delta` to the integer at `key` and return the new value.
    ///
    /// A missing key is created without a TTL.
    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Set the TTL of an existing key. Missing keys are left alone.
    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Remaining time to live, or `None` when the key is absent or has no expiry.
    async fn get_ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Whether a live key exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Delete every key matching the glob pattern, returning how many were removed.
    async fn delete_pattern(&self, pattern: &str) -> StoreResult<u64>;
}

/// Open the counter store described by `config`.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn CounterStore>> {
    match config {
        StorageConfig::Memory { .. } => {
            warn!("Using in-memory counter store; limits are not shared between instances");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StorageConfig::Redis {
            url,
            response_timeout,
        } => {
            let store = RedisStore::connect(url, *response_timeout).await?;
            Ok(Arc::new(store))
        }
    }
}
