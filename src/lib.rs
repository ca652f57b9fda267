//! Resilience and concurrency guards for services sharing a key-value store.
//!
//! - [`resilience`]: circuit breakers, a breaker registry, retry with backoff
//! - [`lock`]: distributed mutual exclusion with token-checked release
//! - [`security`]: distributed rate limiting with tiers and load throttling
//! - [`pipeline`]: [`Guard`], composing all of the above around one call

pub mod admin;
pub mod config;
pub mod lifecycle;
pub mod lock;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod security;
pub mod store;

pub use config::GuardConfig;
pub use lifecycle::Shutdown;
pub use pipeline::{Guard, GuardError, GuardedCall};
