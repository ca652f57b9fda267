//! Rate limiter windows, layering and degradation.

use std::time::Duration;

use ticket_guard::config::{CompoundLimitConfig, RouteLimitConfig, WindowStrategy};
use ticket_guard::security::{RateLimitRequest, RateLimiter, RequestIdentity, WindowClock};
use ticket_guard::store::Store;

mod common;

fn request(user: &str, path: &str) -> RateLimitRequest {
    RateLimitRequest::new(RequestIdentity::user(user), path)
}

#[tokio::test(start_paused = true)]
async fn test_sixth_request_rejected_until_rollover() {
    let (_, guard) = common::guard(&common::config_with_limit(5, 60));
    let limiter = guard.limiter();
    let req = request("buyer-1", "/api/tickets");

    for _ in 0..5 {
        assert!(limiter.check(&req).await.unwrap().allowed);
    }

    let sixth = limiter.check(&req).await.unwrap();
    assert!(!sixth.allowed);
    assert_eq!(sixth.remaining, 0);
    let retry_after = sixth.retry_after.expect("rejection carries retry_after");
    assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(60));

    tokio::time::advance(retry_after + Duration::from_millis(1)).await;
    let fresh = limiter.check(&req).await.unwrap();
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining, 4);
}

#[tokio::test(start_paused = true)]
async fn test_route_and_compound_limits_layer_on_global() {
    let mut config = common::config_with_limit(100, 60);
    config.rate_limit.routes.push(RouteLimitConfig {
        path_prefix: "/api/events".into(),
        max_requests: 10,
        window_secs: 60,
    });
    config.rate_limit.compound.push(CompoundLimitConfig {
        name: "event-purchase".into(),
        path_prefix: "/api/events/".into(),
        max_requests: 2,
        window_secs: 300,
    });
    let (_, guard) = common::guard(&config);
    let limiter = guard.limiter();

    for _ in 0..2 {
        assert!(limiter.check(&request("u-1", "/api/events/evt-1/purchase")).await.unwrap().allowed);
    }
    let capped = limiter.check(&request("u-1", "/api/events/evt-1/purchase")).await.unwrap();
    assert!(!capped.allowed);
    assert_eq!(capped.scope, "event-purchase:evt-1");

    // A different event has its own cap, still under the route limit.
    let other = limiter.check(&request("u-1", "/api/events/evt-2/purchase")).await.unwrap();
    assert!(other.allowed);
    assert_eq!(other.scope, "event-purchase:evt-2");
}

#[tokio::test(start_paused = true)]
async fn test_identity_precedence_shares_one_bucket() {
    let (_, guard) = common::guard(&common::config_with_limit(1, 60));
    let limiter = guard.limiter();

    let with_ip = RateLimitRequest::new(
        RequestIdentity {
            user_id: Some("u-1".into()),
            api_key: None,
            ip: Some("10.1.1.1".parse().unwrap()),
        },
        "/",
    );
    let other_ip = RateLimitRequest::new(
        RequestIdentity {
            user_id: Some("u-1".into()),
            api_key: None,
            ip: Some("10.2.2.2".parse().unwrap()),
        },
        "/",
    );

    assert!(limiter.check(&with_ip).await.unwrap().allowed);
    assert!(!limiter.check(&other_ip).await.unwrap().allowed);
    assert!(limiter.check(&RateLimitRequest::new(RequestIdentity::default(), "/")).await.unwrap().allowed);
}

#[tokio::test(start_paused = true)]
async fn test_sliding_strategy_rolls_over_with_runtime_clock() {
    let mut config = common::config_with_limit(3, 3600);
    config.rate_limit.strategy = WindowStrategy::Sliding;
    let (_, shared) = common::memory_store();
    let limiter = RateLimiter::new(shared, "test", config.rate_limit)
        .with_clock(WindowClock::starting_at(Duration::from_secs(7200)));
    let req = request("u-1", "/");

    let mut allowed = 0;
    for _ in 0..5 {
        if limiter.check(&req).await.unwrap().allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 3);

    // A quarter into the next window, three quarters of five still count.
    tokio::time::advance(Duration::from_secs(3600 + 900)).await;
    let decision = limiter.check(&req).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.retry_after, Some(Duration::from_secs(2700)));

    // Only one request from the window before carries over.
    tokio::time::advance(Duration::from_secs(3600)).await;
    assert!(limiter.check(&req).await.unwrap().allowed);
}

#[tokio::test]
async fn test_outage_fails_open_and_recovers() {
    let (store, guard) = common::guard(&common::config_with_limit(2, 60));
    let limiter: &RateLimiter = guard.limiter();

    store.set_offline(true);
    let degraded = limiter.check(&request("u-1", "/")).await.unwrap();
    assert!(degraded.allowed && degraded.degraded);

    store.set_offline(false);
    let normal = limiter.check(&request("u-1", "/")).await.unwrap();
    assert!(!normal.degraded);
    assert_eq!(normal.remaining, 1);
    assert!(store.ttl("test:rl:global:user:u-1").await.unwrap().is_some());
}
