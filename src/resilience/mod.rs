//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a dependency:
//!     → registry.rs (look up the dependency's breaker by name)
//!     → circuit_breaker.rs (fail fast if open, track outcomes)
//!     → retries.rs (absorb transient failures with backoff)
//!     → backoff.rs (delay schedule, shared with lock acquisition)
//! ```
//!
//! # Design Decisions
//! - Breaker state is per process; instances do not share health views
//! - Retries sit inside the breaker: one exhausted retry sequence is one failure
//! - Failure policy (what counts, what is retryable) is supplied by the caller

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;
pub mod retries;

pub use circuit_breaker::{BreakerConfig, BreakerError, BreakerMetrics, BreakerState, CircuitBreaker};
pub use registry::{BreakerOverrides, BreakerRegistry};
pub use retries::{
    retry_batch, retry_on_specific_errors, with_retry, with_retry_if, with_retry_jitter, BatchOutcome,
    Classified, RetryAttempt, RetryOptions,
};
