//! Distributed lock subsystem.
//!
//! # Data Flow
//! ```text
//! with_lock / with_lock_retry:
//!     → keys.rs (namespaced key for the resource)
//!     → store.set_nx(key, fresh token, ttl)      acquire
//!     → protected work runs
//!     → store.compare_and_delete(key, token)     release, on every exit path
//! ```
//!
//! # Design Decisions
//! - One valid token per key at any instant; the store arbitrates
//! - TTL bounds how long a crashed holder blocks others; no renewal
//! - Release never deletes a lock whose token is not ours
//! - No fairness among waiters
//! - Contention (`Timeout`) and store failure (`System`) are separate errors

pub mod distributed;
pub mod keys;

use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

pub use distributed::{DistributedLock, LockConfig, LockHandle, LockMetrics, LockRetryOptions};
pub use keys::{LockDomain, LockKeys};

/// Lock operation that touched the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    Acquire,
    Release,
}

impl fmt::Display for LockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquire => f.write_str("acquire"),
            Self::Release => f.write_str("release"),
        }
    }
}

/// Errors from lock-protected execution.
#[derive(Debug, Error)]
pub enum LockError<E = Infallible> {
    /// The lock was held by someone else for every attempt.
    #[error("timed out acquiring lock '{key}' (ttl {ttl:?})")]
    Timeout { key: String, ttl: Duration },

    /// The store failed while acquiring or releasing.
    #[error("lock store failure on '{key}' during {phase}: {source}")]
    System {
        key: String,
        phase: LockPhase,
        #[source]
        source: StoreError,
    },

    /// The protected work failed; passed through unchanged.
    #[error("{0}")]
    Work(E),
}

impl<E> LockError<E> {
    /// Contention: map to a "temporarily unavailable" response.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Store failure: alert as an infrastructure incident.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::System { .. })
    }

    pub fn into_work(self) -> Option<E> {
        match self {
            Self::Work(e) => Some(e),
            _ => None,
        }
    }
}

impl LockError<Infallible> {
    /// Re-type an error that cannot carry a work failure.
    pub fn widen<E>(self) -> LockError<E> {
        match self {
            Self::Timeout { key, ttl } => LockError::Timeout { key, ttl },
            Self::System { key, phase, source } => LockError::System { key, phase, source },
            Self::Work(never) => match never {},
        }
    }
}
