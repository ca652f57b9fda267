//! In-process store backend.
//!
//! Used by tests and single-instance deployments. Each operation runs under
//! the shard lock of the key it touches, which gives the same atomicity the
//! networked backend gets from server-side execution.
//!
//! Expiry is evaluated lazily against `tokio::time::Instant`, so tests running
//! on a paused runtime clock can advance TTLs deterministically. Keys that are
//! never touched again are reclaimed by a full sweep every [`SWEEP_EVERY`]
//! writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::store::{Store, StoreError, StoreResult};

/// Writes between full sweeps of expired keys.
pub const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Counter(u64),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A thread-safe in-memory [`Store`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<DashMap<String, Entry>>,
    offline: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked offline".to_string()));
        }
        Ok(())
    }

    /// Remove every expired key. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.len();
        self.inner.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.inner.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired keys from memory store");
        }
        removed
    }

    /// Must run before any entry guard on `inner` is taken.
    fn note_write(&self) {
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.sweep_expired();
        }
    }

    /// Drop `key` if it has expired, so the caller sees it as absent.
    fn purge_expired(&self, key: &str, now: Instant) {
        self.inner.remove_if(key, |_, e| e.is_expired(now));
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_online()?;
        self.note_write();
        let now = Instant::now();
        match self.inner.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Entry {
                        value: Value::Text(value.to_string()),
                        expires_at: Some(now + ttl),
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: Value::Text(value.to_string()),
                    expires_at: Some(now + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check_online()?;
        let now = Instant::now();
        let removed = self.inner.remove_if(key, |_, e| {
            !e.is_expired(now) && matches!(&e.value, Value::Text(v) if v == expected)
        });
        Ok(removed.is_some())
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> StoreResult<u64> {
        self.check_online()?;
        self.note_write();
        let now = Instant::now();
        let fresh = |now: Instant| Entry {
            value: Value::Counter(1),
            expires_at: ttl_on_create.map(|ttl| now + ttl),
        };
        match self.inner.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh(now));
                    return Ok(1);
                }
                let entry = occupied.get_mut();
                match &mut entry.value {
                    Value::Counter(n) => {
                        *n += 1;
                        Ok(*n)
                    }
                    Value::Text(text) => {
                        let parsed: u64 = text
                            .parse()
                            .map_err(|_| StoreError::WrongType(key.to_string()))?;
                        entry.value = Value::Counter(parsed + 1);
                        Ok(parsed + 1)
                    }
                    Value::Sorted(_) => Err(StoreError::WrongType(key.to_string())),
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh(now));
                Ok(1)
            }
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        let now = Instant::now();
        self.purge_expired(key, now);
        match self.inner.get(key) {
            Some(entry) => match &entry.value {
                Value::Text(v) => Ok(Some(v.clone())),
                Value::Counter(n) => Ok(Some(n.to_string())),
                Value::Sorted(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_online()?;
        self.note_write();
        let now = Instant::now();
        self.inner.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check_online()?;
        let now = Instant::now();
        self.purge_expired(key, now);
        Ok(self
            .inner
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .inner
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now)))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_online()?;
        self.note_write();
        let now = Instant::now();
        let mut entry = self.inner.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(HashMap::new()),
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry {
                value: Value::Sorted(HashMap::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Sorted(members) => {
                members.insert(member.to_string(), score);
            }
            _ => return Err(StoreError::WrongType(key.to_string())),
        }
        if let Some(ttl) = ttl {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        self.check_online()?;
        let now = Instant::now();
        self.purge_expired(key, now);
        let Some(entry) = self.inner.get(key) else {
            return Ok(Vec::new());
        };
        let Value::Sorted(members) = &entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let mut hits: Vec<(&String, f64)> = members
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(m, s)| (m, *s))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(hits.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        self.check_online()?;
        let now = Instant::now();
        self.purge_expired(key, now);
        let Some(mut entry) = self.inner.get_mut(key) else {
            return Ok(0);
        };
        let Value::Sorted(members) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let before = members.len();
        members.retain(|_, score| *score < min || *score > max);
        Ok((before - members.len()) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_online()
    }
}
