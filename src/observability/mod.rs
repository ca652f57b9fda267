//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! breaker / retry / lock / rate limiter:
//!     → logging.rs (structured events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint
//! ```

pub mod logging;
pub mod metrics;
