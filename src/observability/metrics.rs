//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define guard metrics (breaker transitions, retries, lock waits, rate decisions)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `guard_breaker_transitions_total` (counter): by breaker, target state
//! - `guard_breaker_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `guard_breaker_rejected_total` (counter): fast-failed calls by breaker
//! - `guard_retries_total` (counter): scheduled retry sleeps
//! - `guard_lock_acquired_total` / `guard_lock_wait_seconds` (counter, histogram)
//! - `guard_lock_timeouts_total` (counter)
//! - `guard_lock_system_errors_total` (counter): by phase
//! - `guard_rate_decisions_total` (counter): by scope, outcome
//! - `guard_rate_anomalies_total` (counter): by scope
//! - `guard_rate_load_factor` (gauge)
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so library users
//!   that never call [`init_metrics`] pay nothing
//! - Label values are bounded: breaker names and scope kinds, never subjects

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::lock::LockPhase;
use crate::resilience::BreakerState;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics recorder"),
    }
}

pub fn record_breaker_transition(name: &str, to: BreakerState) {
    counter!(
        "guard_breaker_transitions_total",
        "breaker" => name.to_string(),
        "state" => to.to_string()
    )
    .increment(1);

    let level = match to {
        BreakerState::Closed => 0.0,
        BreakerState::HalfOpen => 1.0,
        BreakerState::Open => 2.0,
    };
    gauge!("guard_breaker_state", "breaker" => name.to_string()).set(level);
}

pub fn record_breaker_rejected(name: &str) {
    counter!("guard_breaker_rejected_total", "breaker" => name.to_string()).increment(1);
}

pub fn record_retry() {
    counter!("guard_retries_total").increment(1);
}

pub fn record_lock_acquired(wait: Duration) {
    counter!("guard_lock_acquired_total").increment(1);
    histogram!("guard_lock_wait_seconds").record(wait.as_secs_f64());
}

pub fn record_lock_timeout() {
    counter!("guard_lock_timeouts_total").increment(1);
}

pub fn record_lock_system_error(phase: LockPhase) {
    counter!("guard_lock_system_errors_total", "phase" => phase.to_string()).increment(1);
}

/// `scope` is the limit kind (`global`, `route`, compound name), not the full key.
pub fn record_rate_decision(scope: &str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "rejected" };
    counter!(
        "guard_rate_decisions_total",
        "scope" => scope.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_rate_anomaly(scope: &str) {
    counter!("guard_rate_anomalies_total", "scope" => scope.to_string()).increment(1);
}

pub fn record_load_factor(factor: f64) {
    gauge!("guard_rate_load_factor").set(factor);
}
