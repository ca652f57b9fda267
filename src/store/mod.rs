//! Shared key-value store adapter.
//!
//! # Data Flow
//! ```text
//! lock/        → set_nx (acquire), compare_and_delete (release)
//! security/    → incr (window counters), ttl (reset/retry-after),
//!                get/set (load factor), zadd/zrange (anomaly log)
//! ```
//!
//! # Design Decisions
//! - Every cross-process mutation is one atomic store operation
//! - Release is compare-and-delete executed by the store, never read-then-delete
//! - Every key written by this crate carries a TTL
//! - The trait is object-safe so the composition root can pick a backend at runtime

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// Errors raised by a store backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or the connection broke.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The stored value has a type the operation cannot work with.
    #[error("wrong value type at key '{0}'")]
    WrongType(String),

    /// The backend rejected the command.
    #[error("store command failed: {0}")]
    Command(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Operation surface required from the shared store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Write `value` under `key` only if the key is absent. Returns true if written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete `key` only if its current value equals `expected`, as one atomic step.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Atomically increment the counter at `key`, applying `ttl_on_create`
    /// only when this increment created the key.
    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> StoreResult<u64>;

    /// Read a plain value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditionally write a plain value.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remaining time to live, or `None` for a missing or non-expiring key.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Delete a key. Returns true if something was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Add or re-score a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64, ttl: Option<Duration>) -> StoreResult<()>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;

    /// Remove members with `min <= score <= max`. Returns the number removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    /// Round-trip health probe.
    async fn ping(&self) -> StoreResult<()>;
}

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn Store>;
