//! Keyed registry of circuit breakers.
//!
//! One breaker per logical dependency ("payment-gateway", "solana-rpc", ...),
//! created lazily on first lookup and shared for the registry's lifetime.
//! The registry is an ordinary value: the composition root owns the
//! process-wide one, tests build their own.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::resilience::circuit_breaker::{BreakerConfig, BreakerMetrics, CircuitBreaker};

/// Per-breaker overrides merged onto the registry defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl BreakerOverrides {
    fn apply(&self, defaults: &BreakerConfig) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold),
            timeout_ms: self.timeout_ms.unwrap_or(defaults.timeout_ms),
        }
    }
}

/// Registry of named breakers sharing a default configuration.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> &BreakerConfig {
        &self.defaults
    }

    /// Return the breaker registered under `name`, creating it with
    /// `overrides` merged onto the defaults if it does not exist yet.
    ///
    /// Overrides only take effect at creation; later lookups return the
    /// existing instance unchanged.
    pub fn get_breaker(&self, name: &str, overrides: &BreakerOverrides) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = overrides.apply(&self.defaults);
                tracing::debug!(
                    breaker = %name,
                    failure_threshold = config.failure_threshold,
                    success_threshold = config.success_threshold,
                    timeout_ms = config.timeout_ms,
                    "Registered circuit breaker"
                );
                Arc::new(CircuitBreaker::new(name, config))
            })
            .value()
            .clone()
    }

    /// Shorthand for a breaker with default settings.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_breaker(name, &BreakerOverrides::default())
    }

    /// Snapshot of every registered breaker, keyed by name.
    pub fn get_all_states(&self) -> BTreeMap<String, BreakerMetrics> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get_metrics()))
            .collect()
    }

    /// Force every registered breaker Closed.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        tracing::info!(count = self.breakers.len(), "All circuit breakers reset");
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
