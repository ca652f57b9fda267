//! Circuit breaker lifecycle against a paused clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ticket_guard::resilience::{BreakerConfig, BreakerOverrides, BreakerRegistry, BreakerState, CircuitBreaker};

mod common;

fn breaker(failure_threshold: u32, timeout_ms: u64) -> CircuitBreaker {
    CircuitBreaker::new(
        "payment-gateway",
        BreakerConfig {
            failure_threshold,
            success_threshold: 2,
            timeout_ms,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_open_reject_then_probe() {
    let cb = breaker(3, 50);
    let calls = AtomicU32::new(0);
    let failing = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>("gateway timeout")
    };

    for _ in 0..3 {
        let err = cb.execute(failing).await.unwrap_err();
        assert_eq!(err.into_inner(), Some("gateway timeout"));
    }
    assert_eq!(cb.get_state(), BreakerState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_millis(10)).await;
    let rejected = cb.execute(failing).await.unwrap_err();
    assert!(rejected.is_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_millis(50)).await;
    let probe = cb
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>("charged")
        })
        .await;
    assert_eq!(probe.unwrap(), "charged");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(cb.get_state(), BreakerState::HalfOpen);

    cb.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
    assert_eq!(cb.get_state(), BreakerState::Closed);
    let metrics = cb.get_metrics();
    assert_eq!((metrics.failure_count, metrics.success_count), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_immediately() {
    let cb = breaker(3, 50);
    for _ in 0..3 {
        let _ = cb.execute(|| async { Err::<(), _>("down") }).await;
    }

    tokio::time::advance(Duration::from_millis(60)).await;
    let _ = cb.execute(|| async { Err::<(), _>("still down") }).await;
    assert_eq!(cb.get_state(), BreakerState::Open);

    let metrics = cb.get_metrics();
    assert!(metrics.retry_in_ms.is_some_and(|ms| ms > 0));
    assert!(cb.execute(|| async { Ok::<_, &str>(()) }).await.unwrap_err().is_open());
}

#[tokio::test]
async fn test_registry_shares_instances_across_callers() {
    let registry = BreakerRegistry::new(BreakerConfig::default());
    let overrides = BreakerOverrides {
        failure_threshold: Some(1),
        ..BreakerOverrides::default()
    };

    let a = registry.get_breaker("solana-rpc", &overrides);
    let b = registry.breaker("solana-rpc");
    let _ = a.execute(|| async { Err::<(), _>("rpc error") }).await;
    assert_eq!(b.get_state(), BreakerState::Open);

    let states = registry.get_all_states();
    assert_eq!(states["solana-rpc"].state, BreakerState::Open);

    registry.reset_all();
    assert_eq!(a.get_state(), BreakerState::Closed);
}
