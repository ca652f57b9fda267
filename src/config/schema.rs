//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.
//! Breaker, retry and lock sections reuse the option types of their modules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::lock::LockConfig;
use crate::resilience::{BreakerConfig, BreakerOverrides, RetryOptions};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Deployment environment; namespaces every store key.
    pub environment: String,

    /// Shared store backend.
    pub store: StoreConfig,

    /// Defaults for every circuit breaker.
    pub breaker: BreakerConfig,

    /// Per-dependency breaker overrides, keyed by breaker name.
    pub breakers: BTreeMap<String, BreakerOverrides>,

    /// Default retry policy for guarded calls.
    pub retry: RetryOptions,

    /// Distributed lock defaults.
    pub lock: LockConfig,

    /// Rate limiting policy. Hot-reloadable.
    pub rate_limit: RateLimitConfig,

    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,

    /// Reference host listener.
    pub server: ServerConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            store: StoreConfig::default(),
            breaker: BreakerConfig::default(),
            breakers: BTreeMap::new(),
            retry: RetryOptions::default(),
            lock: LockConfig::default(),
            rate_limit: RateLimitConfig::default(),
            observability: ObservabilityConfig::default(),
            admin: AdminConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; single instance and tests only.
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Connection URL for networked backends.
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Window counting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowStrategy {
    /// Counter resets when the window expires.
    Fixed,
    /// Weighted blend of the previous and current fixed windows.
    Sliding,
}

/// A request budget over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct LimitConfig {
    pub max_requests: u64,
    pub window_secs: u64,
}

/// Tighter limit for requests under a path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteLimitConfig {
    pub path_prefix: String,
    pub max_requests: u64,
    pub window_secs: u64,
}

/// Limit per subject per resource, e.g. purchases per user per event.
///
/// The resource id is the path segment right after `path_prefix` unless the
/// caller supplies one explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompoundLimitConfig {
    pub name: String,
    pub path_prefix: String,
    pub max_requests: u64,
    pub window_secs: u64,
}

/// Load-adaptive throttling.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadThrottleConfig {
    pub enabled: bool,

    /// How often the load monitor samples, in seconds.
    pub sample_interval_secs: u64,

    /// Utilization (0.0 to 1.0) at or above which limits shrink.
    pub high_load_threshold: f64,

    /// Multiplier applied to every limit under high load.
    pub reduction_factor: f64,
}

impl Default for LoadThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_secs: 10,
            high_load_threshold: 0.8,
            reduction_factor: 0.5,
        }
    }
}

/// Rate limiting policy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    pub strategy: WindowStrategy,

    /// Applies to every request.
    pub global: LimitConfig,

    /// Longest matching prefix wins.
    pub routes: Vec<RouteLimitConfig>,

    pub compound: Vec<CompoundLimitConfig>,

    /// Tier name to limit multiplier. Unknown tiers get 1.0.
    pub tiers: BTreeMap<String, f64>,

    pub load: LoadThrottleConfig,

    /// A counter above `limit * anomaly_ratio` is logged as an anomaly.
    pub anomaly_ratio: f64,

    /// Allow requests when the store is unreachable.
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let tiers = [("free", 1.0), ("premium", 2.0), ("enterprise", 5.0)]
            .into_iter()
            .map(|(name, m)| (name.to_string(), m))
            .collect();

        Self {
            enabled: true,
            strategy: WindowStrategy::Fixed,
            global: LimitConfig {
                max_requests: 100,
                window_secs: 60,
            },
            routes: Vec::new(),
            compound: Vec::new(),
            tiers,
            load: LoadThrottleConfig::default(),
            anomaly_ratio: 2.0,
            fail_open: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON lines instead of human-readable output.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl ObservabilityConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> String {
        format!("ticket_guard={},tower_http=info", self.log_level)
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // Placeholder; validation rejects it when the admin API is enabled.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Listener for the reference host's demo routes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,

    /// In-flight requests that count as full utilization for load sampling.
    pub max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_in_flight: 1024,
        }
    }
}
