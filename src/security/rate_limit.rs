//! Store-backed request rate limiting.
//!
//! # Responsibilities
//! - Count requests per subject per scope in windows shared across instances
//! - Layer limits: global, longest matching route, per-resource compound caps
//! - Scale limits by subscription tier and by the published load factor
//! - Log subjects that blow far past their limit
//!
//! # Design Decisions
//! - Counters live in the shared store; instances hold no request state
//! - A fixed window is the key's TTL, so the first request after expiry
//!   starts a fresh window
//! - The sliding estimate blends the previous fixed window, weighted by how
//!   much of it still overlaps the trailing window
//! - Store failures allow the request by default (fail open) and are logged
//! - The policy is swapped atomically on config reload; in-flight checks
//!   finish on the policy they started with

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::validation::{validate_rate_limit, ValidationError};
use crate::config::{LimitConfig, RateLimitConfig, WindowStrategy};
use crate::observability::metrics;
use crate::security::identity::{RequestIdentity, Subject};
use crate::store::{SharedStore, StoreError};

/// How long anomaly records are kept.
const ANOMALY_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The store failed and the policy is fail-closed.
    #[error("rate limit store failure: {0}")]
    Store(#[from] StoreError),

    #[error("invalid rate limit policy: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    InvalidPolicy(Vec<ValidationError>),
}

impl RateLimitError {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// What is being rate limited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitRequest {
    pub identity: RequestIdentity,
    pub path: String,
    pub tier: Option<String>,
    /// Explicit resource id for compound limits. Falls back to the path
    /// segment after the compound prefix.
    pub resource: Option<String>,
}

impl RateLimitRequest {
    pub fn new(identity: RequestIdentity, path: impl Into<String>) -> Self {
        Self {
            identity,
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Effective limit after tier and load scaling.
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the deciding window resets.
    pub reset_at: u64,
    /// Time until the window resets.
    pub reset_after: Duration,
    /// Set only when rejected; always positive.
    pub retry_after: Option<Duration>,
    /// The scope that produced this decision.
    pub scope: String,
    pub anomaly: bool,
    /// The store was unreachable and the request was let through.
    pub degraded: bool,
}

impl RateDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: 0,
            reset_after: Duration::ZERO,
            retry_after: None,
            scope: "none".to_string(),
            anomaly: false,
            degraded: false,
        }
    }

    fn fail_open(scope: &Scope, limit: u64, clock: &WindowClock) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: clock.unix_secs_after(scope.window()),
            reset_after: scope.window(),
            retry_after: None,
            scope: scope.name.clone(),
            anomaly: false,
            degraded: true,
        }
    }
}

/// A subject that exceeded its limit by more than the anomaly ratio.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateAnomaly {
    pub subject: String,
    pub scope: String,
    pub count: u64,
    pub limit: u64,
    /// Unix milliseconds when the threshold was crossed.
    pub at_ms: u64,
}

/// One limit that applies to a request.
#[derive(Debug, Clone, PartialEq)]
struct Scope {
    /// Low-cardinality label for metrics.
    kind: String,
    /// Key component, unique per limit and resource.
    name: String,
    limit: LimitConfig,
}

impl Scope {
    fn window(&self) -> Duration {
        Duration::from_secs(self.limit.window_secs)
    }
}

/// Every scope that applies to `path`, coarsest first.
fn scopes_for(policy: &RateLimitConfig, path: &str, resource: Option<&str>) -> Vec<Scope> {
    let mut scopes = vec![Scope {
        kind: "global".to_string(),
        name: "global".to_string(),
        limit: policy.global,
    }];

    if let Some(route) = policy
        .routes
        .iter()
        .filter(|r| matches_prefix(path, &r.path_prefix))
        .max_by_key(|r| r.path_prefix.len())
    {
        scopes.push(Scope {
            kind: "route".to_string(),
            name: format!("route:{}", route.path_prefix),
            limit: LimitConfig {
                max_requests: route.max_requests,
                window_secs: route.window_secs,
            },
        });
    }

    for compound in &policy.compound {
        if !matches_prefix(path, &compound.path_prefix) {
            continue;
        }
        let rest = &path[compound.path_prefix.len()..];
        let resource = resource
            .map(str::to_string)
            .or_else(|| rest.split('/').find(|s| !s.is_empty()).map(str::to_string));
        if let Some(resource) = resource {
            scopes.push(Scope {
                kind: compound.name.clone(),
                name: format!("{}:{}", compound.name, resource),
                limit: LimitConfig {
                    max_requests: compound.max_requests,
                    window_secs: compound.window_secs,
                },
            });
        }
    }

    scopes
}

/// Window length for a scope name as produced by [`scopes_for`].
fn window_for(policy: &RateLimitConfig, scope: &str) -> Option<u64> {
    if scope == "global" {
        return Some(policy.global.window_secs);
    }
    if let Some(prefix) = scope.strip_prefix("route:") {
        return policy
            .routes
            .iter()
            .find(|r| r.path_prefix == prefix)
            .map(|r| r.window_secs);
    }
    let (name, _) = scope.split_once(':')?;
    policy
        .compound
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.window_secs)
}

/// Requests counted against the trailing window under the sliding strategy.
///
/// `elapsed` is the fraction of the current fixed window already past.
fn sliding_estimate(previous: u64, current: u64, elapsed: f64) -> u64 {
    let overlap = (1.0 - elapsed.clamp(0.0, 1.0)) * previous as f64;
    overlap.floor() as u64 + current
}

fn scaled_limit(max_requests: u64, multiplier: f64) -> u64 {
    ((max_requests as f64 * multiplier).floor() as u64).max(1)
}

/// Unix time as seen by the limiter.
///
/// Wall time is read once and then advanced by the runtime's monotonic
/// clock, so sliding windows and store TTLs move together, including under
/// a paused test runtime.
#[derive(Debug, Clone, Copy)]
pub struct WindowClock {
    anchor_unix_ms: u64,
    anchor: Instant,
}

impl WindowClock {
    pub fn system() -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::starting_at(unix)
    }

    /// A clock reading `since_epoch` now.
    pub fn starting_at(since_epoch: Duration) -> Self {
        Self {
            anchor_unix_ms: since_epoch.as_millis() as u64,
            anchor: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.anchor_unix_ms + self.anchor.elapsed().as_millis() as u64
    }

    fn unix_secs_after(&self, delay: Duration) -> u64 {
        (self.now_ms() + delay.as_millis() as u64).div_ceil(1000)
    }
}

impl Default for WindowClock {
    fn default() -> Self {
        Self::system()
    }
}

/// True when `path` is `prefix` or continues it at a segment boundary.
fn matches_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Distributed rate limiter.
pub struct RateLimiter {
    store: SharedStore,
    prefix: String,
    policy: ArcSwap<RateLimitConfig>,
    clock: WindowClock,
}

impl RateLimiter {
    /// `environment` namespaces every key this limiter writes.
    pub fn new(store: SharedStore, environment: impl Into<String>, policy: RateLimitConfig) -> Self {
        Self {
            store,
            prefix: format!("{}:rl", environment.into()),
            policy: ArcSwap::from_pointee(policy),
            clock: WindowClock::system(),
        }
    }

    /// Replace the clock windows are aligned to.
    pub fn with_clock(mut self, clock: WindowClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> Arc<RateLimitConfig> {
        self.policy.load_full()
    }

    /// Replace the policy. Invalid policies are rejected and the old one kept.
    pub fn update_policy(&self, policy: RateLimitConfig) -> Result<(), RateLimitError> {
        let errors = validate_rate_limit(&policy);
        if !errors.is_empty() {
            return Err(RateLimitError::InvalidPolicy(errors));
        }
        self.policy.store(Arc::new(policy));
        tracing::info!("Rate limit policy updated");
        Ok(())
    }

    /// Store key holding the current load factor.
    pub fn load_factor_key(&self) -> String {
        format!("{}:load_factor", self.prefix)
    }

    fn anomaly_key(&self) -> String {
        format!("{}:anomalies", self.prefix)
    }

    fn counter_key(&self, scope: &str, subject: &str) -> String {
        format!("{}:{}:{}", self.prefix, scope, subject)
    }

    /// Check and count one request against every applicable limit.
    ///
    /// Stops at the first limit that rejects. When all allow, returns the
    /// decision with the fewest remaining requests.
    pub async fn check(&self, request: &RateLimitRequest) -> Result<RateDecision, RateLimitError> {
        let policy = self.policy.load_full();
        if !policy.enabled {
            return Ok(RateDecision::unlimited());
        }

        let subject = request.identity.subject();
        let multiplier = self.multiplier(&policy, request.tier.as_deref()).await;

        let mut tightest: Option<RateDecision> = None;
        for scope in scopes_for(&policy, &request.path, request.resource.as_deref()) {
            let limit = scaled_limit(scope.limit.max_requests, multiplier);
            let decision = match self.check_scope(&policy, &subject, &scope, limit).await {
                Ok(decision) => decision,
                Err(e) if policy.fail_open => {
                    tracing::error!(
                        error = %e,
                        scope = %scope.name,
                        subject = %subject,
                        "Rate limit store failure; allowing request"
                    );
                    return Ok(RateDecision::fail_open(&scope, limit, &self.clock));
                }
                Err(e) => return Err(e.into()),
            };

            metrics::record_rate_decision(&scope.kind, decision.allowed);

            if !decision.allowed {
                tracing::warn!(
                    subject = %subject,
                    scope = %decision.scope,
                    limit = decision.limit,
                    retry_after_ms = decision.retry_after.map(|d| d.as_millis() as u64),
                    "Rate limit exceeded"
                );
                return Ok(decision);
            }

            if tightest.as_ref().map_or(true, |t| decision.remaining < t.remaining) {
                tightest = Some(decision);
            }
        }

        Ok(tightest.unwrap_or_else(RateDecision::unlimited))
    }

    async fn check_scope(
        &self,
        policy: &RateLimitConfig,
        subject: &Subject,
        scope: &Scope,
        limit: u64,
    ) -> Result<RateDecision, StoreError> {
        let window = scope.window();
        let key = self.counter_key(&scope.name, &subject.to_string());

        let (used, reset_after) = match policy.strategy {
            WindowStrategy::Fixed => {
                let count = self.store.incr(&key, Some(window)).await?;
                let reset_after = self.store.ttl(&key).await?.unwrap_or(window);
                (count, reset_after)
            }
            WindowStrategy::Sliding => {
                let window_ms = window.as_millis().max(1) as u64;
                let now_ms = self.clock.now_ms();
                let index = now_ms / window_ms;
                let count = self
                    .store
                    .incr(&format!("{key}:{index}"), Some(window * 2))
                    .await?;
                let previous = match index.checked_sub(1) {
                    Some(prev) => self
                        .store
                        .get(&format!("{key}:{prev}"))
                        .await?
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0),
                    None => 0,
                };
                let into_window = now_ms % window_ms;
                let elapsed = into_window as f64 / window_ms as f64;
                (
                    sliding_estimate(previous, count, elapsed),
                    Duration::from_millis(window_ms - into_window),
                )
            }
        };

        let allowed = used <= limit;
        let high_water = (limit as f64 * policy.anomaly_ratio).ceil() as u64;
        let anomaly = used > high_water;
        if used == high_water + 1 {
            self.record_anomaly(subject, scope, used, limit).await;
        }

        Ok(RateDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(used),
            reset_at: self.clock.unix_secs_after(reset_after),
            reset_after,
            retry_after: (!allowed).then(|| reset_after.max(Duration::from_millis(1))),
            scope: scope.name.clone(),
            anomaly,
            degraded: false,
        })
    }

    /// Anomaly logging never affects the decision.
    async fn record_anomaly(&self, subject: &Subject, scope: &Scope, count: u64, limit: u64) {
        let now_ms = self.clock.now_ms();
        let record = RateAnomaly {
            subject: subject.to_string(),
            scope: scope.name.clone(),
            count,
            limit,
            at_ms: now_ms,
        };
        tracing::warn!(
            subject = %record.subject,
            scope = %record.scope,
            count,
            limit,
            "Rate limit anomaly: subject far above limit"
        );
        metrics::record_rate_anomaly(&scope.kind);

        let member = match serde_json::to_string(&record) {
            Ok(member) => member,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode anomaly record");
                return;
            }
        };
        let key = self.anomaly_key();
        let cutoff = now_ms.saturating_sub(ANOMALY_RETENTION.as_millis() as u64);
        let result = async {
            self.store
                .zadd(&key, &member, now_ms as f64, Some(ANOMALY_RETENTION))
                .await?;
            self.store.zrem_range_by_score(&key, 0.0, cutoff as f64).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to persist anomaly record");
        }
    }

    /// Anomalies recorded at or after `since`, oldest first.
    pub async fn recent_anomalies(&self, since: SystemTime) -> Result<Vec<RateAnomaly>, RateLimitError> {
        let since_ms = since
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let members = self
            .store
            .zrange_by_score(&self.anomaly_key(), since_ms as f64, f64::INFINITY)
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect())
    }

    /// Clear the counters of `subject` (as displayed, e.g. `user:42`) in
    /// `scope` (e.g. `global`, `route:/api/checkout`, `event-purchase:evt-9`).
    pub async fn reset(&self, subject: &str, scope: &str) -> Result<bool, RateLimitError> {
        let policy = self.policy.load_full();
        let key = self.counter_key(scope, subject);

        let mut removed = self.store.delete(&key).await?;
        if let Some(window_secs) = window_for(&policy, scope) {
            let index = self.clock.now_ms() / (window_secs.max(1) * 1000);
            for i in [index, index.saturating_sub(1)] {
                removed |= self.store.delete(&format!("{key}:{i}")).await?;
            }
        }

        tracing::info!(subject = %subject, scope = %scope, removed, "Rate limit counters reset");
        Ok(removed)
    }

    /// Combined tier and load multiplier.
    async fn multiplier(&self, policy: &RateLimitConfig, tier: Option<&str>) -> f64 {
        let tier = tier
            .and_then(|t| policy.tiers.get(t).copied())
            .unwrap_or(1.0);
        if !policy.load.enabled {
            return tier;
        }
        tier * self.current_load_factor().await
    }

    /// Load factor published by the load monitor; 1.0 when absent or unreadable.
    pub async fn current_load_factor(&self) -> f64 {
        match self.store.get(&self.load_factor_key()).await {
            Ok(Some(raw)) => raw
                .parse::<f64>()
                .ok()
                .filter(|f| *f > 0.0 && *f <= 1.0)
                .unwrap_or(1.0),
            Ok(None) => 1.0,
            Err(e) => {
                tracing::debug!(error = %e, "Load factor unavailable");
                1.0
            }
        }
    }
}
