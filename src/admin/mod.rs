//! Admin API over the guard's live state.
//!
//! All routes require the configured bearer token.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::pipeline::Guard;

#[derive(Clone)]
pub struct AdminState {
    pub guard: Arc<Guard>,
    pub api_key: Arc<str>,
    pub started_at: Instant,
}

impl AdminState {
    pub fn new(guard: Arc<Guard>, api_key: impl Into<Arc<str>>) -> Self {
        Self {
            guard,
            api_key: api_key.into(),
            started_at: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/breakers/reset", post(reset_breakers))
        .route("/admin/locks", get(get_locks))
        .route("/admin/rate-limits/policy", get(get_rate_limit_policy))
        .route("/admin/rate-limits/anomalies", get(get_anomalies))
        .route("/admin/rate-limits/{subject}/{scope}", delete(reset_rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
