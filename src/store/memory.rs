//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CounterStore, StoreError, StoreResult};
use crate::ratelimit::{Clock, SystemClock};

/// A stored value with an optional absolute expiry (epoch millis).
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Counter store held in process memory.
///
/// Suitable for single-instance deployments and tests. Expired entries are
/// dropped lazily on access; call [`InMemoryStore::purge_expired`]
/// periodically to reclaim memory for keys that are never touched again.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose TTLs are evaluated against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired counters");
        }
        purged
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(now: u64, ttl: Duration) -> Option<u64> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Some(now.saturating_add(ttl_ms))
    }

    fn evict_if_expired(&self, key: &str, now: u64) {
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_millis();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.evict_if_expired(key, now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_millis();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let now = self.clock.now_millis();
        // The entry guard holds the shard lock, which makes the add atomic.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: None,
            });

        if !entry.is_live(now) {
            *entry = Entry {
                value: "0".to_string(),
                expires_at: None,
            };
        }

        let current: i64 = entry.value.parse().map_err(|_| StoreError::NotAnInteger)?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::Backend("increment would overflow".to_string()))?;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_millis();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_live(now) {
                entry.expires_at = Self::expiry(now, ttl);
            }
        }
        Ok(())
    }

    async fn get_ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = self.clock.now_millis();
        let ttl = self.entries.get(key).and_then(|entry| match entry.expires_at {
            Some(expires_at) if now < expires_at => {
                Some(Duration::from_millis(expires_at - now))
            }
            _ => None,
        });
        Ok(ttl)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .get(key)
            .map_or(false, |entry| entry.is_live(now)))
    }

    async fn delete_pattern(&self, pattern: &str) -> StoreResult<u64> {
        let mut deleted = 0u64;
        self.entries.retain(|key, _| {
            if fast_glob::glob_match(pattern, key) {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }
}
