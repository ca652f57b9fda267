//! Guarded execution: the composition of all primitives.
//!
//! # Data Flow
//! ```text
//! Guard::run(call, work)
//!     → rate_limit   admission (skipped without a RateLimitRequest)
//!     → lock         exclusive section (optional)
//!     → breaker      fail fast while the dependency is unhealthy (optional)
//!     → retry        absorbs transient failures (optional)
//!     → work
//! ```
//!
//! The breaker sees one outcome per retry sequence, so a dependency is only
//! counted as failing once retries are exhausted.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{GuardConfig, StoreBackend};
use crate::lock::{DistributedLock, LockError, LockKeys};
use crate::resilience::{with_retry_jitter, BreakerError, BreakerOverrides, BreakerRegistry, CircuitBreaker, RetryOptions};
use crate::security::{RateDecision, RateLimitError, RateLimitRequest, RateLimiter};
use crate::store::{MemoryStore, SharedStore, StoreError};

/// Which layer refused a guarded call, or the work's own error.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error("rate limited in scope '{}'", .0.scope)]
    RateLimited(RateDecision),

    #[error(transparent)]
    RateLimiter(RateLimitError),

    #[error(transparent)]
    Lock(LockError),

    #[error("circuit breaker '{name}' is open; retry in {retry_after:?}")]
    BreakerOpen { name: String, retry_after: Duration },

    #[error("{0}")]
    Work(E),
}

impl<E> GuardError<E> {
    /// The call was refused to protect a resource; retry later.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::BreakerOpen { .. } => true,
            Self::Lock(e) => e.is_unavailable(),
            _ => false,
        }
    }

    /// The shared store failed underneath a guard layer.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::RateLimiter(e) => e.is_infrastructure(),
            Self::Lock(e) => e.is_infrastructure(),
            _ => false,
        }
    }

    /// Suggested wait before trying again, when a layer knows one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(decision) => decision.retry_after,
            Self::BreakerOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn into_work(self) -> Option<E> {
        match self {
            Self::Work(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LockSpec {
    key: String,
    ttl: Option<Duration>,
    retry: bool,
}

/// Which layers a call goes through.
#[derive(Debug, Clone, Default)]
pub struct GuardedCall {
    rate_limit: Option<RateLimitRequest>,
    lock: Option<LockSpec>,
    breaker: Option<String>,
    retry: Option<RetryOptions>,
}

impl GuardedCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limited(mut self, request: RateLimitRequest) -> Self {
        self.rate_limit = Some(request);
        self
    }

    /// Single acquisition attempt; `None` uses the configured default TTL.
    pub fn locked(mut self, key: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.lock = Some(LockSpec {
            key: key.into(),
            ttl,
            retry: false,
        });
        self
    }

    /// Acquisition retried with the configured lock backoff.
    pub fn locked_with_retry(mut self, key: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.lock = Some(LockSpec {
            key: key.into(),
            ttl,
            retry: true,
        });
        self
    }

    pub fn breaker(mut self, dependency: impl Into<String>) -> Self {
        self.breaker = Some(dependency.into());
        self
    }

    pub fn retry(mut self, options: RetryOptions) -> Self {
        self.retry = Some(options);
        self
    }
}

/// Owns one instance of every primitive, built from one [`GuardConfig`].
pub struct Guard {
    store: SharedStore,
    breakers: Arc<BreakerRegistry>,
    breaker_overrides: BTreeMap<String, BreakerOverrides>,
    lock: DistributedLock,
    limiter: Arc<RateLimiter>,
    retry: RetryOptions,
}

impl Guard {
    pub fn new(store: SharedStore, config: &GuardConfig) -> Self {
        Self {
            breakers: Arc::new(BreakerRegistry::new(config.breaker.clone())),
            breaker_overrides: config.breakers.clone(),
            lock: DistributedLock::new(
                store.clone(),
                LockKeys::new(config.environment.clone()),
                config.lock.clone(),
            ),
            limiter: Arc::new(RateLimiter::new(
                store.clone(),
                config.environment.clone(),
                config.rate_limit.clone(),
            )),
            retry: config.retry.clone(),
            store,
        }
    }

    /// Build the configured store backend, then the guard on top of it.
    pub async fn connect(config: &GuardConfig) -> Result<Self, StoreError> {
        let store: SharedStore = match config.store.backend {
            StoreBackend::Memory => {
                tracing::warn!("Using in-process memory store; locks and limits are not shared");
                Arc::new(MemoryStore::new())
            }
            #[cfg(feature = "redis-store")]
            StoreBackend::Redis => Arc::new(crate::store::RedisStore::connect(&config.store.url).await?),
            #[cfg(not(feature = "redis-store"))]
            StoreBackend::Redis => {
                return Err(StoreError::Unavailable(
                    "redis backend requested but built without the redis-store feature".to_string(),
                ))
            }
        };
        store.ping().await?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn default_retry(&self) -> RetryOptions {
        self.retry.clone()
    }

    /// Breaker for `dependency` with any configured overrides applied.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        match self.breaker_overrides.get(dependency) {
            Some(overrides) => self.breakers.get_breaker(dependency, overrides),
            None => self.breakers.breaker(dependency),
        }
    }

    pub async fn run<F, Fut, T, E>(&self, call: GuardedCall, work: F) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if let Some(request) = &call.rate_limit {
            let decision = self
                .limiter
                .check(request)
                .await
                .map_err(GuardError::RateLimiter)?;
            if !decision.allowed {
                return Err(GuardError::RateLimited(decision));
            }
        }

        let breaker = call.breaker.as_deref().map(|name| self.breaker(name));
        let retry = call.retry.as_ref();
        let protected = || self.call_through(breaker, retry, work);

        let Some(spec) = &call.lock else {
            return protected().await;
        };

        let ttl = spec.ttl.unwrap_or_else(|| self.lock.config().default_ttl());
        let result = if spec.retry {
            let options = self.lock.config().retry_options();
            self.lock
                .with_lock_retry(&spec.key, ttl, protected, &options)
                .await
        } else {
            self.lock.with_lock(&spec.key, ttl, protected).await
        };
        result.map_err(flatten_lock_error)
    }

    async fn call_through<F, Fut, T, E>(
        &self,
        breaker: Option<Arc<CircuitBreaker>>,
        retry: Option<&RetryOptions>,
        work: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let attempt = || retry_work(work, retry);
        match breaker {
            Some(breaker) => breaker.execute(attempt).await.map_err(|e| match e {
                BreakerError::Open { name, retry_after } => GuardError::BreakerOpen { name, retry_after },
                BreakerError::Inner(e) => GuardError::Work(e),
            }),
            None => attempt().await.map_err(GuardError::Work),
        }
    }
}

async fn retry_work<F, Fut, T, E>(mut work: F, retry: Option<&RetryOptions>) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    match retry {
        Some(options) => with_retry_jitter(work, options).await,
        None => work().await,
    }
}

fn flatten_lock_error<E>(error: LockError<GuardError<E>>) -> GuardError<E> {
    match error {
        LockError::Work(inner) => inner,
        LockError::Timeout { key, ttl } => GuardError::Lock(LockError::<Infallible>::Timeout { key, ttl }),
        LockError::System { key, phase, source } => {
            GuardError::Lock(LockError::<Infallible>::System { key, phase, source })
        }
    }
}
