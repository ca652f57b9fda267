//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: probing whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: first call attempted after the open timeout elapsed
//! Half-Open → Closed: consecutive probe successes >= success_threshold
//! Half-Open → Open: any probe failure
//! ```
//!
//! # Design Decisions
//! - One breaker per dependency, owned by this process only
//! - Fail fast in Open state; the dependency is never contacted
//! - Single probe in flight while Half-Open
//! - Transitions happen only inside `execute`, never on a timer
//! - Counters reset on every transition; outcomes from calls admitted in an
//!   earlier generation are discarded

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::observability::metrics;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,

    /// Consecutive half-open successes before closing.
    pub success_threshold: u32,

    /// Delay before an open breaker admits a probe, in milliseconds.
    pub timeout_ms: u64,
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Read-only snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Time until an open breaker admits a probe.
    pub retry_in_ms: Option<u64>,
    #[serde(skip)]
    pub next_attempt_at: Option<Instant>,
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Call short-circuited; the dependency was not contacted.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String, retry_after: Duration },

    /// The protected call failed; the error is passed through unchanged.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The wrapped work error, if the call was actually made.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
    generation: u64,
    probe_in_flight: bool,
}

/// Per-dependency failure isolation state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new breaker in the Closed state.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt_at: None,
                generation: 0,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `f` through the breaker. Every `Err` counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(f, |_| true).await
    }

    /// Run `f` through the breaker, counting only errors for which
    /// `is_failure` returns true. Other errors are returned to the caller but
    /// recorded as successes.
    pub async fn execute_classified<F, Fut, T, E, P>(&self, f: F, is_failure: P) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let permit = self.admit().map_err(|retry_after| BreakerError::Open {
            name: self.name.clone(),
            retry_after,
        })?;

        let result = f().await;
        match &result {
            Err(e) if is_failure(e) => permit.complete(false),
            _ => permit.complete(true),
        }
        result.map_err(BreakerError::Inner)
    }

    /// Current state. Never transitions.
    pub fn get_state(&self) -> BreakerState {
        self.lock().state
    }

    /// Snapshot of state and counters.
    pub fn get_metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        let now = Instant::now();
        let next = match inner.state {
            BreakerState::Open => inner.next_attempt_at,
            _ => None,
        };
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_in_ms: next.map(|at| at.saturating_duration_since(now).as_millis() as u64),
            next_attempt_at: next,
        }
    }

    /// Force the breaker Closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, BreakerState::Closed, Instant::now());
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }

    /// Decide whether a call may proceed. Returns the remaining open time on rejection.
    fn admit(&self) -> Result<Permit<'_>, Duration> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => Ok(Permit::new(self, inner.generation, false)),
            BreakerState::Open => {
                let next_attempt_at = inner.next_attempt_at.unwrap_or(now);
                if now < next_attempt_at {
                    metrics::record_breaker_rejected(&self.name);
                    tracing::debug!(breaker = %self.name, "Call rejected: circuit open");
                    return Err(next_attempt_at - now);
                }
                self.transition(&mut inner, BreakerState::HalfOpen, now);
                inner.probe_in_flight = true;
                Ok(Permit::new(self, inner.generation, true))
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    metrics::record_breaker_rejected(&self.name);
                    tracing::debug!(breaker = %self.name, "Call rejected: probe already in flight");
                    return Err(Duration::ZERO);
                }
                inner.probe_in_flight = true;
                Ok(Permit::new(self, inner.generation, true))
            }
        }
    }

    fn record(&self, generation: u64, probe: bool, success: bool) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if probe {
            inner.probe_in_flight = false;
        }

        let now = Instant::now();
        match (inner.state, success) {
            (BreakerState::Closed, true) => inner.failure_count = 0,
            (BreakerState::Closed, false) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    let failures = inner.failure_count;
                    self.transition(&mut inner, BreakerState::Open, now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures,
                        timeout_ms = self.config.timeout_ms,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            (BreakerState::HalfOpen, true) => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed, now);
                    tracing::info!(breaker = %self.name, "Circuit closed after successful recovery");
                }
            }
            (BreakerState::HalfOpen, false) => {
                self.transition(&mut inner, BreakerState::Open, now);
                tracing::warn!(breaker = %self.name, "Circuit reopened after failed probe");
            }
            (BreakerState::Open, _) => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.probe_in_flight = false;
        inner.generation += 1;
        inner.next_attempt_at = match to {
            BreakerState::Open => Some(now + self.config.timeout()),
            _ => None,
        };

        if from != to {
            if to == BreakerState::HalfOpen {
                tracing::info!(breaker = %self.name, "Circuit half-open, probing dependency");
            }
            metrics::record_breaker_transition(&self.name, to);
        }
    }
}

/// Admission ticket for one call. A permit dropped without completing (the
/// caller's future was cancelled) releases the probe slot without counting.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    done: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, probe: bool) -> Self {
        Self {
            breaker,
            generation,
            probe,
            done: false,
        }
    }

    fn complete(mut self, success: bool) {
        self.done = true;
        self.breaker.record(self.generation, self.probe, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.done || !self.probe {
            return;
        }
        let mut inner = self.breaker.lock();
        if inner.generation == self.generation {
            inner.probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failures: u32, successes: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "payment-gateway",
            BreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                timeout_ms,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        cb.execute(|| async { Err::<(), _>("gateway down".to_string()) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        cb.execute(|| async { Ok::<_, String>(7) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 1, 1000);
        for i in 1..=2 {
            assert!(matches!(fail(&cb).await, Err(BreakerError::Inner(_))));
            assert_eq!(cb.get_metrics().failure_count, i);
            assert_eq!(cb.get_state(), BreakerState::Closed);
        }
        let err = fail(&cb).await.unwrap_err();
        assert_eq!(err.into_inner().as_deref(), Some("gateway down"));
        assert_eq!(cb.get_state(), BreakerState::Open);
        assert_eq!(cb.get_metrics().failure_count, 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1, 1000);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.get_metrics().failure_count, 0);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.get_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let cb = breaker(1, 1, 1000);
        fail(&cb).await.unwrap_err();

        let calls = AtomicU32::new(0);
        let res = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        match res {
            Err(BreakerError::Open { name, retry_after }) => {
                assert_eq!(name, "payment-gateway");
                assert_eq!(retry_after, Duration::from_millis(1000));
            }
            other => panic!("expected open error, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_immediately() {
        let cb = breaker(3, 2, 500);
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_millis(500)).await;

        // probe fails: straight back to open, no re-accumulation
        assert!(matches!(fail(&cb).await, Err(BreakerError::Inner(_))));
        assert_eq!(cb.get_state(), BreakerState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = breaker(1, 2, 100);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(100)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.get_state(), BreakerState::HalfOpen);
        assert_eq!(cb.get_metrics().success_count, 1);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.get_state(), BreakerState::Closed);
        let m = cb.get_metrics();
        assert_eq!((m.failure_count, m.success_count), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_in_flight() {
        let cb = breaker(1, 1, 100);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(100)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = cb.execute(|| async move {
            let _ = rx.await;
            Ok::<_, String>(1)
        });
        tokio::pin!(probe);

        // Drive the probe until it parks on the channel.
        assert!(futures_util::poll!(probe.as_mut()).is_pending());
        assert_eq!(cb.get_state(), BreakerState::HalfOpen);
        assert!(succeed(&cb).await.unwrap_err().is_open());

        tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap(), 1);
        assert_eq!(cb.get_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_classified_errors_do_not_trip() {
        let cb = breaker(1, 1, 1000);
        let res = cb
            .execute_classified(|| async { Err::<(), _>("404 not found") }, |e| !e.starts_with("404"))
            .await;
        assert!(matches!(res, Err(BreakerError::Inner("404 not found"))));
        assert_eq!(cb.get_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_reset_from_any_state() {
        let cb = breaker(1, 1, 60_000);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.get_state(), BreakerState::Open);

        cb.reset();
        let m = cb.get_metrics();
        assert_eq!(m.state, BreakerState::Closed);
        assert_eq!((m.failure_count, m.success_count), (0, 0));
        assert!(m.retry_in_ms.is_none());
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }
}
