//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, windows > 0, ratios in range)
//! - Check addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: GuardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system, including on reload

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{GuardConfig, RateLimitConfig};

/// One semantic problem, located by its dotted config path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.environment.trim().is_empty() {
        errors.push(ValidationError::new("environment", "must not be empty"));
    }

    if config.breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("breaker.failure_threshold", "must be at least 1"));
    }
    if config.breaker.success_threshold == 0 {
        errors.push(ValidationError::new("breaker.success_threshold", "must be at least 1"));
    }
    for (name, overrides) in &config.breakers {
        if overrides.failure_threshold == Some(0) || overrides.success_threshold == Some(0) {
            errors.push(ValidationError::new(
                format!("breakers.{name}"),
                "thresholds must be at least 1",
            ));
        }
    }

    if config.retry.max_attempts == 0 {
        errors.push(ValidationError::new("retry.max_attempts", "must be at least 1"));
    }
    if config.retry.backoff_multiplier < 1.0 {
        errors.push(ValidationError::new("retry.backoff_multiplier", "must be >= 1.0"));
    }
    if !(0.0..=1.0).contains(&config.retry.jitter_ratio) {
        errors.push(ValidationError::new("retry.jitter_ratio", "must be within 0.0..=1.0"));
    }

    if config.lock.default_ttl_ms == 0 {
        errors.push(ValidationError::new("lock.default_ttl_ms", "must be greater than 0"));
    }
    if config.lock.backoff_multiplier < 1.0 {
        errors.push(ValidationError::new("lock.backoff_multiplier", "must be >= 1.0"));
    }
    if !(0.0..=1.0).contains(&config.lock.jitter_ratio) {
        errors.push(ValidationError::new("lock.jitter_ratio", "must be within 0.0..=1.0"));
    }

    errors.extend(validate_rate_limit(&config.rate_limit));

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address",
        ));
    }

    if config.admin.enabled {
        if config.admin.api_key.len() < 16 || config.admin.api_key == "CHANGE_ME_IN_PRODUCTION" {
            errors.push(ValidationError::new(
                "admin.api_key",
                "must be set to a secret of at least 16 characters",
            ));
        }
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new("admin.bind_address", "must be a socket address"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Rate limit checks, shared with live policy updates.
pub fn validate_rate_limit(policy: &RateLimitConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut limit = |field: String, max_requests: u64, window_secs: u64| {
        if max_requests == 0 {
            errors.push(ValidationError::new(format!("{field}.max_requests"), "must be at least 1"));
        }
        if window_secs == 0 {
            errors.push(ValidationError::new(format!("{field}.window_secs"), "must be at least 1"));
        }
    };

    limit(
        "rate_limit.global".to_string(),
        policy.global.max_requests,
        policy.global.window_secs,
    );
    for (i, route) in policy.routes.iter().enumerate() {
        limit(format!("rate_limit.routes[{i}]"), route.max_requests, route.window_secs);
    }
    for (i, compound) in policy.compound.iter().enumerate() {
        limit(
            format!("rate_limit.compound[{i}]"),
            compound.max_requests,
            compound.window_secs,
        );
    }

    for (i, route) in policy.routes.iter().enumerate() {
        if !route.path_prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("rate_limit.routes[{i}].path_prefix"),
                "must start with '/'",
            ));
        }
    }
    for (i, compound) in policy.compound.iter().enumerate() {
        if compound.name.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("rate_limit.compound[{i}].name"),
                "must not be empty",
            ));
        }
        if !compound.path_prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("rate_limit.compound[{i}].path_prefix"),
                "must start with '/'",
            ));
        }
    }

    for (tier, multiplier) in &policy.tiers {
        if multiplier.is_nan() || *multiplier <= 0.0 {
            errors.push(ValidationError::new(
                format!("rate_limit.tiers.{tier}"),
                "multiplier must be positive",
            ));
        }
    }

    if policy.load.enabled {
        if policy.load.sample_interval_secs == 0 {
            errors.push(ValidationError::new(
                "rate_limit.load.sample_interval_secs",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&policy.load.high_load_threshold) {
            errors.push(ValidationError::new(
                "rate_limit.load.high_load_threshold",
                "must be within 0.0..=1.0",
            ));
        }
        if policy.load.reduction_factor.is_nan()
            || policy.load.reduction_factor <= 0.0
            || policy.load.reduction_factor > 1.0
        {
            errors.push(ValidationError::new(
                "rate_limit.load.reduction_factor",
                "must be within (0.0, 1.0]",
            ));
        }
    }

    if policy.anomaly_ratio < 1.0 {
        errors.push(ValidationError::new("rate_limit.anomaly_ratio", "must be >= 1.0"));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RouteLimitConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&GuardConfig::default()), Ok(()));
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = GuardConfig::default();
        config.breaker.failure_threshold = 0;
        config.retry.max_attempts = 0;
        config.rate_limit.global.window_secs = 0;
        config.rate_limit.routes.push(RouteLimitConfig {
            path_prefix: "api".into(),
            max_requests: 0,
            window_secs: 10,
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"breaker.failure_threshold"));
        assert!(fields.contains(&"retry.max_attempts"));
        assert!(fields.contains(&"rate_limit.global.window_secs"));
        assert!(fields.contains(&"rate_limit.routes[0].max_requests"));
        assert!(fields.contains(&"rate_limit.routes[0].path_prefix"));
    }

    #[test]
    fn test_admin_requires_real_key_when_enabled() {
        let mut config = GuardConfig::default();
        config.admin.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "admin.api_key");

        config.admin.api_key = "a-long-enough-admin-secret".into();
        assert!(validate_config(&config).is_ok());
    }
}
