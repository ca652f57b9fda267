//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ticket_guard::config::{GuardConfig, LimitConfig};
use ticket_guard::resilience::RetryOptions;
use ticket_guard::store::{MemoryStore, SharedStore};
use ticket_guard::Guard;

/// A fresh in-memory store, plus the same store as a trait object.
pub fn memory_store() -> (Arc<MemoryStore>, SharedStore) {
    let store = Arc::new(MemoryStore::new());
    let shared: SharedStore = store.clone();
    (store, shared)
}

/// A config whose global limit is `max_requests` per `window_secs`.
pub fn config_with_limit(max_requests: u64, window_secs: u64) -> GuardConfig {
    let mut config = GuardConfig::default();
    config.environment = "test".to_string();
    config.rate_limit.global = LimitConfig {
        max_requests,
        window_secs,
    };
    config
}

pub fn guard(config: &GuardConfig) -> (Arc<MemoryStore>, Guard) {
    let (store, shared) = memory_store();
    (store, Guard::new(shared, config))
}

/// Retry policy with short delays, suitable for a paused clock.
pub fn fast_retry(max_attempts: u32) -> RetryOptions {
    RetryOptions::new(max_attempts).with_delays(
        Duration::from_millis(10),
        2.0,
        Duration::from_millis(100),
    )
}

/// Counts calls and fails the first `failures` of them.
#[derive(Debug, Default)]
pub struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub async fn call(&self) -> Result<u32, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err(format!("transient failure #{n}"))
        } else {
            Ok(n)
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}
