//! DDoS guard: per-IP threshold with a hard block.
//!
//! An IP moves from Normal to Blocked once its request count within the DDoS
//! window reaches the threshold. The block is a flag key in the counter store
//! whose TTL is the block duration, so every process sharing the store sees it
//! and it lifts itself when the key expires.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use super::algorithm::Algorithm;
use super::clock::Clock;
use super::key::{ddos_block_key, mask_ip, CounterKey};
use super::result::{LimitType, RateLimitResult};
use super::rules::{DdosConfig, Quota};
use crate::store::{CounterStore, StoreResult};

/// A block observed by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedIp {
    /// Masked client IP
    pub ip: String,
    /// Unix timestamp (seconds) at which the block lifts
    pub until: u64,
}

/// Per-IP abuse detector.
pub struct DdosGuard {
    config: DdosConfig,
    prefix: String,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    /// Process-local record of blocks (IP -> block end, epoch millis), used to
    /// log each Normal -> Blocked transition once. Not authoritative.
    blocked: DashMap<String, u64>,
}

impl std::fmt::Debug for DdosGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdosGuard")
            .field("config", &self.config)
            .field("prefix", &self.prefix)
            .field("tracked_blocks", &self.blocked.len())
            .finish()
    }
}

impl DdosGuard {
    /// Create a guard writing to `store` under `prefix`.
    pub fn new(
        config: DdosConfig,
        prefix: impl Into<String>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            prefix: prefix.into(),
            store,
            clock,
            blocked: DashMap::new(),
        }
    }

    /// Check an IP. Returns a denial when the IP is, or just became, blocked.
    pub async fn check(&self, ip: &str) -> StoreResult<Option<RateLimitResult>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let now = self.clock.now();
        let block_key = ddos_block_key(&self.prefix, ip);

        // The TTL read doubles as the existence check.
        if let Some(remaining) = self.store.get_ttl(&block_key).await? {
            debug!(ip = %mask_ip(ip), remaining = ?remaining, "Request from blocked IP");
            return Ok(Some(self.blocked_result(ip, now, remaining)));
        }

        // Block expired (or cleared): back to Normal.
        self.blocked.remove(ip);

        let key = CounterKey::new(&self.prefix, LimitType::Ddos, ip);
        let quota = Quota::new(self.config.threshold, self.config.window);
        let result = Algorithm::FixedWindow
            .check(self.store.as_ref(), now, &key, &quota)
            .await?;

        if result.allowed {
            return Ok(None);
        }

        self.store
            .set(&block_key, "1", self.config.block_duration)
            .await?;
        self.record_transition(ip, now);

        Ok(Some(self.blocked_result(ip, now, self.config.block_duration)))
    }

    fn record_transition(&self, ip: &str, now: Duration) {
        let until = now.saturating_add(self.config.block_duration).as_millis();
        let until = u64::try_from(until).unwrap_or(u64::MAX);
        match self.blocked.entry(ip.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(until);
                warn!(
                    ip = %mask_ip(ip),
                    threshold = self.config.threshold,
                    window_secs = self.config.window.as_secs(),
                    block_secs = self.config.block_duration.as_secs(),
                    "DDoS threshold exceeded, blocking IP"
                );
            }
            Entry::Occupied(mut entry) => {
                entry.insert(until);
            }
        }
    }

    fn blocked_result(&self, ip: &str, now: Duration, remaining: Duration) -> RateLimitResult {
        RateLimitResult {
            allowed: false,
            limit: self.config.threshold,
            remaining: 0,
            reset_at: now.saturating_add(remaining).as_secs_f64().ceil() as u64,
            retry_after: Some(remaining),
            limit_type: LimitType::Ddos,
            limit_key: CounterKey::new(&self.prefix, LimitType::Ddos, ip).masked(),
        }
    }

    /// Forget the local record of a block, after an administrative clear.
    pub fn forget(&self, ip: &str) {
        self.blocked.remove(ip);
    }

    /// Blocks this process has observed that have not yet lifted.
    pub fn blocked_ips(&self) -> Vec<BlockedIp> {
        let now = self.clock.now_millis();
        self.blocked.retain(|_, until| *until > now);
        let mut blocked: Vec<BlockedIp> = self
            .blocked
            .iter()
            .map(|entry| BlockedIp {
                ip: mask_ip(entry.key()),
                until: entry.value().div_ceil(1000),
            })
            .collect();
        blocked.sort_by(|a, b| a.until.cmp(&b.until).then_with(|| a.ip.cmp(&b.ip)));
        blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use crate::store::InMemoryStore;

    fn guard(config: DdosConfig) -> (DdosGuard, Arc<InMemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let guard = DdosGuard::new(config, "rl", store.clone(), clock.clone());
        (guard, store, clock)
    }

    fn config(threshold: u64) -> DdosConfig {
        DdosConfig {
            enabled: true,
            threshold,
            window: Duration::from_secs(10),
            block_duration: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_normal_traffic_passes() {
        let (guard, _, _) = guard(config(5));
        for _ in 0..5 {
            assert!(guard.check("10.0.0.1").await.unwrap().is_none());
        }
        assert!(guard.blocked_ips().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_triggers_block() {
        let (guard, store, _) = guard(config(3));
        for _ in 0..3 {
            assert!(guard.check("10.0.0.1").await.unwrap().is_none());
        }

        let denied = guard.check("10.0.0.1").await.unwrap().unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.limit_type, LimitType::Ddos);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(60)));
        assert_eq!(denied.limit_key, "ddos:10.0.0.*");
        assert!(store.exists("rl|ddos_block|10.0.0.1").await.unwrap());

        let blocked = guard.blocked_ips();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].ip, "10.0.0.*");
        assert_eq!(blocked[0].until, 1_700_000_060);

        // Other IPs are unaffected
        assert!(guard.check("10.0.0.2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_block_outlives_window_and_expires() {
        let (guard, _, clock) = guard(config(2));
        for _ in 0..3 {
            guard.check("10.0.0.1").await.unwrap();
        }

        // The counting window has rolled over but the block holds
        clock.advance(Duration::from_secs(30));
        let denied = guard.check("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(denied.retry_after, Some(Duration::from_secs(30)));

        clock.advance(Duration::from_secs(30));
        assert!(guard.check("10.0.0.1").await.unwrap().is_none());
        assert!(guard.blocked_ips().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_ip_does_not_count() {
        let (guard, store, _) = guard(config(1));
        guard.check("10.0.0.1").await.unwrap();
        guard.check("10.0.0.1").await.unwrap();

        let before = store.len();
        for _ in 0..10 {
            assert!(guard.check("10.0.0.1").await.unwrap().is_some());
        }
        assert_eq!(store.len(), before);
    }

    #[tokio::test]
    async fn test_disabled_guard_never_blocks() {
        let mut config = config(1);
        config.enabled = false;
        let (guard, store, _) = guard(config);

        for _ in 0..10 {
            assert!(guard.check("10.0.0.1").await.unwrap().is_none());
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_forget_drops_local_record() {
        let (guard, _, _) = guard(config(1));
        guard.check("10.0.0.1").await.unwrap();
        guard.check("10.0.0.1").await.unwrap();
        assert_eq!(guard.blocked_ips().len(), 1);

        guard.forget("10.0.0.1");
        assert!(guard.blocked_ips().is_empty());
    }

    #[tokio::test]
    async fn test_expired_block_is_not_reported() {
        let (guard, store, clock) = guard(config(100));
        store
            .set("rl|ddos_block|10.0.0.1", "1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(guard.check("10.0.0.1").await.unwrap().is_some());

        clock.advance(Duration::from_secs(5));
        assert!(guard.check("10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_long_block_duration_does_not_overflow() {
        let mut config = config(1);
        config.block_duration = Duration::from_secs(u64::MAX);
        let (guard, _, _) = guard(config);

        guard.check("10.0.0.1").await.unwrap();
        let denied = guard.check("10.0.0.1").await.unwrap().unwrap();
        assert!(!denied.allowed);
        assert_eq!(guard.blocked_ips().len(), 1);
    }
}
