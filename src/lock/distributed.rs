//! Store-arbitrated mutual exclusion.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::lock::keys::LockKeys;
use crate::lock::{LockError, LockPhase};
use crate::observability::metrics;
use crate::resilience::backoff::{apply_jitter, calculate_backoff};
use crate::store::{SharedStore, StoreError};

/// Lock defaults.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL used when a caller does not pick one, in milliseconds.
    pub default_ttl_ms: u64,

    /// Acquisition retries after the first attempt (`with_lock_retry`).
    pub max_retries: u32,

    /// Delay before the first acquisition retry, in milliseconds.
    pub initial_delay_ms: u64,

    pub backoff_multiplier: f64,

    pub max_delay_ms: u64,

    /// Jitter as a fraction of each retry delay. Zero disables it.
    pub jitter_ratio: f64,
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn retry_options(&self) -> LockRetryOptions {
        LockRetryOptions {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter_ratio,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            max_retries: 10,
            initial_delay_ms: 100,
            backoff_multiplier: 1.5,
            max_delay_ms: 2_000,
            jitter_ratio: 0.1,
        }
    }
}

/// Acquisition retry schedule for [`DistributedLock::with_lock_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct LockRetryOptions {
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Used as given, like [`RetryOptions::backoff_multiplier`](crate::resilience::RetryOptions::backoff_multiplier).
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for LockRetryOptions {
    fn default() -> Self {
        LockConfig::default().retry_options()
    }
}

/// Proof of ownership of one acquired lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
    pub acquired_at: Instant,
}

impl LockHandle {
    /// Instant after which the store may hand the key to someone else.
    pub fn expires_at(&self) -> Instant {
        self.acquired_at + self.ttl
    }
}

/// Snapshot of lock activity in this process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockMetrics {
    /// Locks currently held by protected sections in this process.
    pub held: u64,
    pub acquired_total: u64,
    pub timeouts_total: u64,
    pub system_errors_total: u64,
    /// Mean time from first attempt to successful acquisition.
    pub average_wait_ms: f64,
}

#[derive(Debug, Default)]
struct LockStats {
    held: AtomicU64,
    acquired: AtomicU64,
    timeouts: AtomicU64,
    system_errors: AtomicU64,
    wait_micros: AtomicU64,
}

/// Decrements the held-lock gauge when the protected section ends, including
/// when the caller's future is dropped mid-section.
struct HeldGuard<'a>(&'a LockStats);

impl<'a> HeldGuard<'a> {
    fn new(stats: &'a LockStats) -> Self {
        stats.held.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for HeldGuard<'_> {
    fn drop(&mut self) {
        self.0.held.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Distributed lock over a shared [`Store`](crate::store::Store).
#[derive(Clone)]
pub struct DistributedLock {
    store: SharedStore,
    keys: LockKeys,
    config: LockConfig,
    stats: Arc<LockStats>,
}

impl DistributedLock {
    pub fn new(store: SharedStore, keys: LockKeys, config: LockConfig) -> Self {
        Self {
            store,
            keys,
            config,
            stats: Arc::new(LockStats::default()),
        }
    }

    pub fn keys(&self) -> &LockKeys {
        &self.keys
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// One conditional-set attempt. `Ok(None)` means another holder owns the key.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        let started = Instant::now();
        let handle = self.attempt(key, ttl).await?;
        if handle.is_some() {
            self.record_acquired(started.elapsed());
        }
        Ok(handle)
    }

    /// Release `handle` with compare-and-delete. Returns false when the key no
    /// longer carries our token (expired, possibly re-acquired by another holder).
    pub async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        match self.store.compare_and_delete(&handle.key, &handle.token).await {
            Ok(released) => {
                if released {
                    tracing::debug!(key = %handle.key, "Lock released");
                } else {
                    tracing::warn!(
                        key = %handle.key,
                        held_ms = handle.acquired_at.elapsed().as_millis() as u64,
                        ttl_ms = handle.ttl.as_millis() as u64,
                        "Lock expired before release; token no longer current"
                    );
                }
                Ok(released)
            }
            Err(source) => Err(self.system_error(&handle.key, LockPhase::Release, source)),
        }
    }

    /// Non-blocking probe. Store failures count as "not acquired".
    ///
    /// The handle is not returned; the lock is held until its TTL lapses.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> bool {
        match self.acquire(key, ttl).await {
            Ok(handle) => handle.is_some(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "try_lock failed on store error");
                false
            }
        }
    }

    /// Single acquisition attempt, then run `f` and release on every exit path.
    pub async fn with_lock<F, Fut, T, E>(&self, key: &str, ttl: Duration, f: F) -> Result<T, LockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let handle = match self.attempt(key, ttl).await.map_err(|e| e.widen())? {
            Some(handle) => handle,
            None => return Err(self.timeout(key, ttl)),
        };
        self.record_acquired(started.elapsed());
        self.run_locked(handle, f).await
    }

    /// Retry acquisition with backoff until it succeeds or `max_retries` is
    /// exhausted. Errors from `f` are never retried.
    pub async fn with_lock_retry<F, Fut, T, E>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
        options: &LockRetryOptions,
    ) -> Result<T, LockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut retry = 0;

        let handle = loop {
            if let Some(handle) = self.attempt(key, ttl).await.map_err(|e| e.widen())? {
                break handle;
            }
            if retry >= options.max_retries {
                return Err(self.timeout(key, ttl));
            }
            retry += 1;

            let delay = apply_jitter(
                calculate_backoff(retry, options.initial_delay, options.backoff_multiplier, options.max_delay),
                options.jitter_ratio,
            );
            tracing::debug!(
                key = %key,
                retry,
                delay_ms = delay.as_millis() as u64,
                "Lock busy, retrying acquisition"
            );
            tokio::time::sleep(delay).await;
        };

        self.record_acquired(started.elapsed());
        self.run_locked(handle, f).await
    }

    pub fn get_metrics(&self) -> LockMetrics {
        let acquired = self.stats.acquired.load(Ordering::Relaxed);
        let wait_micros = self.stats.wait_micros.load(Ordering::Relaxed);
        LockMetrics {
            held: self.stats.held.load(Ordering::Relaxed),
            acquired_total: acquired,
            timeouts_total: self.stats.timeouts.load(Ordering::Relaxed),
            system_errors_total: self.stats.system_errors.load(Ordering::Relaxed),
            average_wait_ms: if acquired == 0 {
                0.0
            } else {
                wait_micros as f64 / acquired as f64 / 1000.0
            },
        }
    }

    async fn attempt(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        let token = new_token();
        match self.store.set_nx(key, &token, ttl).await {
            Ok(true) => {
                tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
                Ok(Some(LockHandle {
                    key: key.to_string(),
                    token,
                    ttl,
                    acquired_at: Instant::now(),
                }))
            }
            Ok(false) => Ok(None),
            Err(source) => Err(self.system_error(key, LockPhase::Acquire, source)),
        }
    }

    async fn run_locked<F, Fut, T, E>(&self, handle: LockHandle, f: F) -> Result<T, LockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let result = {
            let _held = HeldGuard::new(&self.stats);
            f().await
        };

        let released = self.release(&handle).await;
        match (result, released) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(e)) => Err(e.widen()),
            (Err(work), Ok(_)) => Err(LockError::Work(work)),
            (Err(work), Err(e)) => {
                // The work error takes precedence; the release failure was already counted.
                tracing::error!(key = %handle.key, error = %e, "Lock release failed after work error");
                Err(LockError::Work(work))
            }
        }
    }

    fn record_acquired(&self, wait: Duration) {
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        self.stats
            .wait_micros
            .fetch_add(wait.as_micros() as u64, Ordering::Relaxed);
        metrics::record_lock_acquired(wait);
    }

    fn timeout<E>(&self, key: &str, ttl: Duration) -> LockError<E> {
        self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::record_lock_timeout();
        tracing::warn!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lock acquisition timed out");
        LockError::Timeout {
            key: key.to_string(),
            ttl,
        }
    }

    fn system_error(&self, key: &str, phase: LockPhase, source: StoreError) -> LockError {
        self.stats.system_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_lock_system_error(phase);
        tracing::error!(key = %key, phase = %phase, error = %source, "Lock store failure");
        LockError::System {
            key: key.to_string(),
            phase,
            source,
        }
    }
}

/// Fresh ownership token: process id, wall-clock nanos, random suffix.
fn new_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}-{}-{}", std::process::id(), nanos, uuid::Uuid::new_v4().simple())
}
