use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::admin::AdminState;
use crate::config::RateLimitConfig;
use crate::lock::LockMetrics;
use crate::resilience::{BreakerMetrics, BreakerState};
use crate::security::RateAnomaly;

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub environment: String,
    pub store_reachable: bool,
    pub uptime_secs: u64,
    pub breakers: usize,
    pub open_breakers: Vec<String>,
    pub locks_held: u64,
    pub load_factor: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetQuery {
    /// Reset only this breaker.
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnomalyQuery {
    /// Look-back window in seconds.
    #[serde(default = "default_since_secs")]
    pub since_secs: u64,
}

fn default_since_secs() -> u64 {
    3600
}

fn unavailable(error: impl std::fmt::Display) -> Response {
    tracing::error!(error = %error, "Admin request failed on store");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let guard = &state.guard;
    let store_reachable = guard.store().ping().await.is_ok();
    let breakers = guard.breakers().get_all_states();
    let open_breakers = breakers
        .iter()
        .filter(|(_, m)| m.state != BreakerState::Closed)
        .map(|(name, _)| name.clone())
        .collect();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: if store_reachable { "operational" } else { "degraded" }.to_string(),
        environment: guard.lock().keys().environment().to_string(),
        store_reachable,
        uptime_secs: state.started_at.elapsed().as_secs(),
        breakers: breakers.len(),
        open_breakers,
        locks_held: guard.lock().get_metrics().held,
        load_factor: guard.limiter().current_load_factor().await,
    })
}

pub async fn get_breakers(State(state): State<AdminState>) -> Json<BTreeMap<String, BreakerMetrics>> {
    Json(state.guard.breakers().get_all_states())
}

pub async fn reset_breakers(
    State(state): State<AdminState>,
    Query(query): Query<ResetQuery>,
) -> Response {
    let registry = state.guard.breakers();
    match query.name {
        Some(name) => {
            if !registry.get_all_states().contains_key(&name) {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": format!("unknown breaker '{name}'") })),
                )
                    .into_response();
            }
            registry.breaker(&name).reset();
            tracing::info!(breaker = %name, "Circuit breaker reset via admin API");
            Json(json!({ "reset": [name] })).into_response()
        }
        None => {
            let names: Vec<String> = registry.get_all_states().into_keys().collect();
            registry.reset_all();
            Json(json!({ "reset": names })).into_response()
        }
    }
}

pub async fn get_locks(State(state): State<AdminState>) -> Json<LockMetrics> {
    Json(state.guard.lock().get_metrics())
}

pub async fn get_anomalies(
    State(state): State<AdminState>,
    Query(query): Query<AnomalyQuery>,
) -> Result<Json<Vec<RateAnomaly>>, Response> {
    let since = SystemTime::now()
        .checked_sub(Duration::from_secs(query.since_secs))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    state
        .guard
        .limiter()
        .recent_anomalies(since)
        .await
        .map(Json)
        .map_err(unavailable)
}

pub async fn get_rate_limit_policy(State(state): State<AdminState>) -> Json<RateLimitConfig> {
    Json(state.guard.limiter().policy().as_ref().clone())
}

pub async fn reset_rate_limit(
    State(state): State<AdminState>,
    Path((subject, scope)): Path<(String, String)>,
) -> Response {
    match state.guard.limiter().reset(&subject, &scope).await {
        Ok(removed) => Json(json!({ "subject": subject, "scope": scope, "removed": removed })).into_response(),
        Err(e) => unavailable(e),
    }
}
