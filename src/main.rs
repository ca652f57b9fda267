//! Reference host for ticket-guard.
//!
//! ```text
//!   client ──▶ in-flight tracking ──▶ rate_limit_middleware ──▶ purchase handler
//!                     │                                              │
//!                     ▼                                              ▼
//!               LoadMonitor ──▶ store ◀── Guard::run(lock → breaker → retry → work)
//!
//!   admin client ──▶ bearer auth ──▶ /admin/* (breakers, locks, rate limits)
//! ```
//!
//! Wires config, logging, metrics, the guard, background tasks and both
//! listeners, then waits for SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use ticket_guard::admin::{setup_admin_router, AdminState};
use ticket_guard::config::{load_config, ConfigWatcher, GuardConfig};
use ticket_guard::lifecycle::{shutdown_signal, Shutdown};
use ticket_guard::observability::{logging, metrics};
use ticket_guard::security::{rate_limit_middleware, InFlightSampler, LoadMonitor};
use ticket_guard::{Guard, GuardError, GuardedCall};

#[derive(Parser)]
#[command(name = "ticket-guard", version)]
struct Args {
    /// TOML config file. Defaults apply when omitted.
    #[arg(short, long, env = "GUARD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    guard: Arc<Guard>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GuardConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(
        environment = %config.environment,
        store = ?config.store.backend,
        "ticket-guard v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                error = %e,
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let guard = Arc::new(Guard::connect(&config).await?);
    let shutdown = Shutdown::new();

    let sampler = Arc::new(InFlightSampler::new(config.server.max_in_flight));
    let monitor = LoadMonitor::new(
        guard.store().clone(),
        guard.limiter().load_factor_key(),
        config.rate_limit.load.clone(),
        sampler.clone(),
    );
    tokio::spawn(monitor.run(shutdown.subscribe()));

    // Kept alive for the life of the process.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path, &config);
            let handle = watcher.run()?;
            let guard = guard.clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(next) = updates.recv() => {
                            if let Err(e) = guard.limiter().update_policy(next.rate_limit) {
                                tracing::error!(error = %e, "Ignoring reloaded rate limit policy");
                            }
                        }
                        _ = stop.recv() => break,
                    }
                }
            });
            Some(handle)
        }
        None => None,
    };

    if config.admin.enabled {
        let admin = setup_admin_router(AdminState::new(guard.clone(), config.admin.api_key.clone()));
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(listener, admin)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin server failed");
            }
        });
    }

    let app = Router::new()
        .route("/api/events/{event_id}/purchase", post(purchase))
        .with_state(AppState { guard: guard.clone() })
        .layer(middleware::from_fn_with_state(
            guard.limiter().clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(sampler, track_in_flight))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("Shutting down");
        shutdown.trigger();
    })
    .await?;

    // Give background loops a moment to observe the signal.
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn track_in_flight(
    State(sampler): State<Arc<InFlightSampler>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let _in_flight = sampler.track();
    next.run(request).await
}

/// Demo purchase: serialized per event, guarded against a flaky gateway.
async fn purchase(State(state): State<AppState>, Path(event_id): Path<String>) -> Response {
    let guard = &state.guard;
    let call = GuardedCall::new()
        .locked_with_retry(guard.lock().keys().event_inventory(&event_id), None)
        .breaker("payment-gateway")
        .retry(guard.default_retry());

    let result = guard
        .run(call, || async {
            Ok::<_, String>(json!({
                "event_id": event_id,
                "order_id": uuid::Uuid::new_v4().to_string(),
            }))
        })
        .await;

    match result {
        Ok(order) => (StatusCode::CREATED, Json(order)).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(error: GuardError<String>) -> Response {
    let status = match &error {
        GuardError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        e if e.is_unavailable() || e.is_infrastructure() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    if error.is_infrastructure() {
        tracing::error!(error = %error, "Guarded call failed on infrastructure");
    }
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}
