//! Security subsystem: distributed rate limiting.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → middleware.rs (gather identity, path, tier)
//!     → identity.rs (user > api key > ip > anonymous)
//!     → rate_limit.rs (count in shared store per scope, decide)
//!     → 429 with Retry-After, or pass through with X-RateLimit-* headers
//!
//! Background:
//!     load.rs samples utilization → publishes load factor → rate_limit.rs scales limits
//! ```
//!
//! # Design Decisions
//! - Counters are shared across instances through the store
//! - Fail open on store failure unless the policy says otherwise

pub mod identity;
pub mod load;
pub mod middleware;
pub mod rate_limit;

pub use identity::{CallerContext, RequestIdentity, Subject};
pub use load::{InFlightSampler, LoadMonitor, LoadSampler};
pub use middleware::rate_limit_middleware;
pub use rate_limit::{RateAnomaly, RateDecision, RateLimitError, RateLimitRequest, RateLimiter, WindowClock};
