//! Full guarded calls: admission, lock, breaker, retry, work.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware,
    routing::post,
    Router,
};
use tower::ServiceExt;

use ticket_guard::security::{rate_limit_middleware, CallerContext, RateLimitRequest, RequestIdentity};
use ticket_guard::{Guard, GuardError, GuardedCall};

mod common;

#[tokio::test(start_paused = true)]
async fn test_retry_absorbs_transient_failures_inside_lock() {
    let (_, guard) = common::guard(&common::config_with_limit(10, 60));
    let flaky = common::Flaky::new(2);
    let key = guard.lock().keys().reservation("r-1");

    let call = GuardedCall::new()
        .rate_limited(RateLimitRequest::new(RequestIdentity::user("u-1"), "/reserve"))
        .locked(key.clone(), Some(Duration::from_secs(5)))
        .breaker("inventory-db")
        .retry(common::fast_retry(3));

    let attempt = guard.run(call, || flaky.call()).await.unwrap();
    assert_eq!(attempt, 3);
    assert_eq!(flaky.calls(), 3);

    let breaker = guard.breaker("inventory-db").get_metrics();
    assert_eq!(breaker.failure_count, 0);
    assert!(guard.lock().try_lock(&key, Duration::from_secs(1)).await, "lock released");
    assert_eq!(guard.lock().get_metrics().held, 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_short_circuits_before_work() {
    let mut config = common::config_with_limit(100, 60);
    config.breaker.failure_threshold = 1;
    let (_, guard) = common::guard(&config);
    let flaky = common::Flaky::new(u32::MAX);

    let call = || GuardedCall::new().breaker("fraud-api");
    let first = guard.run(call(), || flaky.call()).await.unwrap_err();
    assert!(matches!(first, GuardError::Work(_)));

    let second = guard.run(call(), || flaky.call()).await.unwrap_err();
    assert!(second.is_unavailable());
    assert!(second.retry_after().is_some());
    assert_eq!(flaky.calls(), 1);
}

#[tokio::test]
async fn test_store_outage_surfaces_as_infrastructure() {
    let mut config = common::config_with_limit(100, 60);
    config.rate_limit.fail_open = false;
    let (store, guard) = common::guard(&config);
    store.set_offline(true);

    let admitted = GuardedCall::new().rate_limited(RateLimitRequest::new(RequestIdentity::user("u-1"), "/"));
    let err = guard
        .run(admitted, || async { Ok::<_, String>(()) })
        .await
        .unwrap_err();
    assert!(err.is_infrastructure());

    let locked = GuardedCall::new().locked("test:lock:ticket:t-1", None);
    let err = guard
        .run(locked, || async { Ok::<_, String>(()) })
        .await
        .unwrap_err();
    assert!(err.is_infrastructure());
    assert!(!err.is_unavailable());
}

async fn checkout(State(guard): State<Arc<Guard>>) -> StatusCode {
    let call = GuardedCall::new()
        .locked(guard.lock().keys().payment("order-1"), None)
        .breaker("payment-gateway");
    match guard.run(call, || async { Ok::<_, String>(()) }).await {
        Ok(()) => StatusCode::CREATED,
        Err(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        Err(_) => StatusCode::BAD_GATEWAY,
    }
}

#[tokio::test]
async fn test_http_stack_limits_per_caller() {
    let (_, guard) = common::guard(&common::config_with_limit(2, 60));
    let guard = Arc::new(guard);
    let app = Router::new()
        .route("/checkout", post(checkout))
        .with_state(guard.clone())
        .layer(middleware::from_fn_with_state(guard.limiter().clone(), rate_limit_middleware));

    let as_user = |user: &str| {
        let mut req = Request::builder()
            .method("POST")
            .uri("/checkout")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(CallerContext {
            user_id: user.to_string(),
            tier: None,
        });
        req
    };

    for _ in 0..2 {
        let res = app.clone().oneshot(as_user("alice")).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }
    let limited = app.clone().oneshot(as_user("alice")).await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key("retry-after"));

    let other = app.oneshot(as_user("bob")).await.unwrap();
    assert_eq!(other.status(), StatusCode::CREATED);
    assert_eq!(other.headers()["x-ratelimit-remaining"], "1");
}
