//! Load-adaptive throttling.
//!
//! # Responsibilities
//! - Periodically sample local utilization
//! - Publish a limit multiplier to the shared store for every instance
//!
//! The published factor carries a TTL of a few sample intervals, so a dead
//! monitor cannot leave limits reduced forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::config::LoadThrottleConfig;
use crate::observability::metrics;
use crate::store::SharedStore;

/// Source of a utilization reading between 0.0 (idle) and 1.0 (saturated).
pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> f64;
}

impl<F> LoadSampler for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn sample(&self) -> f64 {
        self()
    }
}

/// Utilization measured as in-flight requests over a fixed capacity.
#[derive(Debug)]
pub struct InFlightSampler {
    in_flight: AtomicUsize,
    capacity: usize,
}

impl InFlightSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Count a request as in flight until the guard drops.
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            sampler: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl LoadSampler for InFlightSampler {
    fn sample(&self) -> f64 {
        (self.in_flight() as f64 / self.capacity as f64).min(1.0)
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    sampler: Arc<InFlightSampler>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.sampler.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Publishes the load factor read by every [`RateLimiter`](super::RateLimiter).
pub struct LoadMonitor {
    store: SharedStore,
    key: String,
    config: LoadThrottleConfig,
    sampler: Arc<dyn LoadSampler>,
}

impl LoadMonitor {
    /// `key` is normally [`RateLimiter::load_factor_key`](super::RateLimiter::load_factor_key).
    pub fn new(
        store: SharedStore,
        key: impl Into<String>,
        config: LoadThrottleConfig,
        sampler: Arc<dyn LoadSampler>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            config,
            sampler,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Load-adaptive throttling disabled");
            return;
        }

        tracing::info!(
            interval_secs = self.config.sample_interval_secs,
            threshold = self.config.high_load_threshold,
            "Load monitor starting"
        );

        let mut ticker = time::interval(self.interval());
        let mut last = 1.0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    last = self.tick(last).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Load monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sample_interval_secs.max(1))
    }

    /// The factor to publish for a utilization reading.
    pub fn factor_for(&self, load: f64) -> f64 {
        if load >= self.config.high_load_threshold {
            self.config.reduction_factor
        } else {
            1.0
        }
    }

    /// Sample once and publish. Returns the factor now in effect.
    pub async fn tick(&self, previous: f64) -> f64 {
        let load = self.sampler.sample();
        let factor = self.factor_for(load);

        if let Err(e) = self
            .store
            .set(&self.key, &factor.to_string(), Some(self.interval() * 3))
            .await
        {
            tracing::warn!(error = %e, "Failed to publish load factor");
            return previous;
        }

        metrics::record_load_factor(factor);
        if factor != previous {
            if factor < 1.0 {
                tracing::warn!(load, factor, "High load: reducing rate limits");
            } else {
                tracing::info!(load, "Load subsided: restoring rate limits");
            }
        }
        factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use std::sync::atomic::AtomicU64;

    #[tokio::test]
    async fn test_tick_publishes_and_restores_factor() {
        let store = Arc::new(MemoryStore::new());
        let reading = Arc::new(AtomicU64::new(0.9f64.to_bits()));
        let source = reading.clone();
        let sampler: Arc<dyn LoadSampler> =
            Arc::new(move || f64::from_bits(source.load(Ordering::Relaxed)));

        let monitor = LoadMonitor::new(store.clone(), "test:rl:load_factor", LoadThrottleConfig::default(), sampler);

        let factor = monitor.tick(1.0).await;
        assert_eq!(factor, 0.5);
        assert_eq!(store.get("test:rl:load_factor").await.unwrap().as_deref(), Some("0.5"));

        reading.store(0.2f64.to_bits(), Ordering::Relaxed);
        assert_eq!(monitor.tick(factor).await, 1.0);
        assert_eq!(store.get("test:rl:load_factor").await.unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_in_flight_sampler_tracks_guards() {
        let sampler = Arc::new(InFlightSampler::new(4));
        let a = sampler.track();
        let _b = sampler.track();
        assert_eq!(sampler.sample(), 0.5);
        drop(a);
        assert_eq!(sampler.in_flight(), 1);
    }
}
