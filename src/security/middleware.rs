//! Axum middleware enforcing the rate limiter.
//!
//! Identity comes from a [`CallerContext`] extension set by upstream auth,
//! the `x-api-key` header, or the peer address, in that order.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::security::identity::{CallerContext, RequestIdentity};
use crate::security::rate_limit::{RateDecision, RateLimitRequest, RateLimiter};

const API_KEY_HEADER: &str = "x-api-key";

/// Build the limiter input from request parts.
pub fn rate_limit_request(request: &Request<Body>) -> RateLimitRequest {
    let caller = request.extensions().get::<CallerContext>();
    let identity = RequestIdentity {
        user_id: caller.map(|c| c.user_id.clone()),
        api_key: request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ip: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
    };

    RateLimitRequest {
        identity,
        path: request.uri().path().to_string(),
        tier: caller.and_then(|c| c.tier.clone()),
        resource: None,
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let input = rate_limit_request(&request);

    let decision = match limiter.check(&input).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(error = %e, path = %input.path, "Rate limiter unavailable; rejecting");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "rate_limiter_unavailable" })),
            )
                .into_response();
        }
    };

    if !decision.allowed {
        let retry_after_secs = decision
            .retry_after
            .map(|d| d.as_millis().div_ceil(1000) as u64)
            .unwrap_or(1)
            .max(1);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate_limit_exceeded",
                "scope": decision.scope,
                "retry_after": retry_after_secs,
            })),
        )
            .into_response();
        apply_headers(response.headers_mut(), &decision);
        insert(response.headers_mut(), "retry-after", retry_after_secs);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    if decision.limit == u64::MAX {
        return;
    }
    insert(headers, "x-ratelimit-limit", decision.limit);
    insert(headers, "x-ratelimit-remaining", decision.remaining);
    insert(headers, "x-ratelimit-reset", decision.reset_at);
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: u64) {
    headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitConfig, RateLimitConfig};
    use crate::store::MemoryStore;
    use axum::{middleware, routing::get, Router};
    use tower::ServiceExt;

    fn app(max_requests: u64) -> Router {
        let policy = RateLimitConfig {
            global: LimitConfig {
                max_requests,
                window_secs: 60,
            },
            ..RateLimitConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new()), "test", policy));
        Router::new()
            .route("/tickets", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
    }

    fn request() -> Request<Body> {
        Request::builder()
            .uri("/tickets")
            .header(API_KEY_HEADER, "key-1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_headers_and_rejection() {
        let app = app(1);

        let ok = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()["x-ratelimit-limit"], "1");
        assert_eq!(ok.headers()["x-ratelimit-remaining"], "0");
        assert!(ok.headers().contains_key("x-ratelimit-reset"));

        let limited = app.oneshot(request()).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = limited.headers()["retry-after"].to_str().unwrap().parse().unwrap();
        assert!(retry_after >= 1);
    }

    #[test]
    fn test_caller_context_takes_precedence() {
        let mut req = request();
        req.extensions_mut().insert(CallerContext {
            user_id: "u-9".into(),
            tier: Some("premium".into()),
        });
        let input = rate_limit_request(&req);
        assert_eq!(input.identity.subject().to_string(), "user:u-9");
        assert_eq!(input.tier.as_deref(), Some("premium"));
        assert_eq!(input.path, "/tickets");
    }
}
