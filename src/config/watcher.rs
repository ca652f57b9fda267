//! Configuration file watcher for hot reload.
//!
//! Only the rate limit policy is applied live; other sections are read once
//! at startup and a change to them is logged as requiring a restart.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::GuardConfig;

/// Monitors the configuration file and emits each valid new version.
pub struct ConfigWatcher {
    path: PathBuf,
    baseline: GuardConfig,
    update_tx: mpsc::UnboundedSender<GuardConfig>,
}

impl ConfigWatcher {
    /// `current` is the config the process started with.
    pub fn new(path: &Path, current: &GuardConfig) -> (Self, mpsc::UnboundedReceiver<GuardConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                baseline: current.clone(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();
        let mut last = self.baseline;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    match load_config(&path) {
                        Ok(new_config) => {
                            let stale = restart_sections(&last, &new_config);
                            if !stale.is_empty() {
                                tracing::warn!(
                                    sections = ?stale,
                                    "Config sections changed that only take effect after restart"
                                );
                            }
                            tracing::info!(path = ?path, "Config change detected");
                            last = new_config.clone();
                            let _ = tx.send(new_config);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Rejected config reload; keeping current policy");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Sections that differ between `old` and `new`, other than `rate_limit`.
pub fn restart_sections(old: &GuardConfig, new: &GuardConfig) -> Vec<&'static str> {
    fn differs<T: Serialize>(a: &T, b: &T) -> bool {
        serde_json::to_value(a).ok() != serde_json::to_value(b).ok()
    }

    let mut sections = Vec::new();
    if old.environment != new.environment {
        sections.push("environment");
    }
    if differs(&old.store, &new.store) {
        sections.push("store");
    }
    if differs(&old.breaker, &new.breaker) || differs(&old.breakers, &new.breakers) {
        sections.push("breaker");
    }
    if differs(&old.retry, &new.retry) {
        sections.push("retry");
    }
    if differs(&old.lock, &new.lock) {
        sections.push("lock");
    }
    if differs(&old.observability, &new.observability) {
        sections.push("observability");
    }
    if differs(&old.admin, &new.admin) {
        sections.push("admin");
    }
    if differs(&old.server, &new.server) {
        sections.push("server");
    }
    sections
}
