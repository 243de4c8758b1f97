//! Rate limit orchestrator.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::access::AccessControl;
use super::clock::{Clock, SystemClock};
use super::ddos::{BlockedIp, DdosGuard};
use super::key::{ip_patterns, mask_ip, user_patterns};
use super::resolver::{ClientIdentity, LimitResolver, Route};
use super::result::{most_restrictive, RateLimitResult};
use super::rules::{FailureMode, RateLimitConfig};
use super::stats::{LimiterStats, StatsSnapshot};
use crate::store::{CounterStore, StoreError, StoreResult};

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Denial {
    /// Caller is on the blacklist. Nothing was counted.
    Blacklisted,
    /// Caller's IP is blocked by the DDoS guard.
    Ddos(RateLimitResult),
    /// One of the tiered quota checks denied.
    QuotaExceeded(RateLimitResult),
    /// The counter store failed and the failure mode is `deny`.
    StoreUnavailable,
}

impl Denial {
    /// The result behind the denial, if counting produced one.
    pub fn result(&self) -> Option<&RateLimitResult> {
        match self {
            Denial::Ddos(result) | Denial::QuotaExceeded(result) => Some(result),
            Denial::Blacklisted | Denial::StoreUnavailable => None,
        }
    }
}

/// Outcome of checking a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Limiting does not apply (disabled or whitelisted); no headers.
    Bypass,
    /// Every check passed. Carries the most restrictive result, or `None`
    /// when the store failed open.
    Allowed(Option<RateLimitResult>),
    /// The request must be rejected.
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied(_))
    }
}

/// Runs every applicable check for a request and reduces them to one
/// decision.
///
/// This struct is thread-safe and can be shared across multiple tasks. It
/// holds no mutable state of its own besides statistics and the DDoS guard's
/// transition bookkeeping; counters live in the store.
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    access: AccessControl,
    ddos: DdosGuard,
    resolver: LimitResolver,
    stats: LimiterStats,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("ddos", &self.ddos)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter driven by the system clock.
    pub fn new(config: Arc<RateLimitConfig>, store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit time source.
    pub fn with_clock(
        config: Arc<RateLimitConfig>,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ddos = DdosGuard::new(
            config.ddos.clone(),
            config.key_prefix.clone(),
            store.clone(),
            clock.clone(),
        );

        Self {
            access: AccessControl::from_config(&config),
            resolver: LimitResolver::new(config.clone()),
            ddos,
            config,
            store,
            clock,
            stats: LimiterStats::default(),
        }
    }

    /// The configuration this limiter enforces.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check a request against every applicable limit.
    ///
    /// Order: disabled, blacklist, whitelist, DDoS guard, then the resolved
    /// quota checks in sequence. The first failing check denies the request.
    pub async fn check(&self, route: &Route, identity: &ClientIdentity) -> Decision {
        self.stats.record_checked();

        if !self.config.enabled {
            self.stats.record_bypassed();
            return Decision::Bypass;
        }

        if self.access.is_blacklisted(identity) {
            self.stats.record_blacklisted();
            warn!(
                ip = %mask_ip(&identity.ip),
                user_id = ?identity.user_id,
                method = %route.method,
                path = %route.path,
                "Rejected blacklisted client"
            );
            return Decision::Denied(Denial::Blacklisted);
        }

        if self.access.is_whitelisted(identity) {
            self.stats.record_bypassed();
            trace!(ip = %mask_ip(&identity.ip), "Whitelisted client, skipping rate limits");
            return Decision::Bypass;
        }

        match self.run_checks(route, identity).await {
            Ok(decision) => decision,
            Err(e) => self.on_store_failure(route, identity, e),
        }
    }

    async fn run_checks(
        &self,
        route: &Route,
        identity: &ClientIdentity,
    ) -> StoreResult<Decision> {
        if let Some(result) = self.ddos.check(&identity.ip).await? {
            self.stats.record_denied(result.limit_type);
            return Ok(Decision::Denied(Denial::Ddos(result)));
        }

        let now = self.clock.now();
        let checks = self.resolver.resolve(route, identity);
        let mut results = Vec::with_capacity(checks.len());

        for check in checks {
            let result = self
                .config
                .algorithm
                .check(self.store.as_ref(), now, &check.key, &check.quota)
                .await?;

            if !result.allowed {
                self.stats.record_denied(result.limit_type);
                warn!(
                    limit_type = %result.limit_type,
                    key = %result.limit_key,
                    limit = result.limit,
                    reset_at = result.reset_at,
                    retry_after_secs = ?result.retry_after_secs(),
                    method = %route.method,
                    path = %route.path,
                    "Rate limit exceeded"
                );
                return Ok(Decision::Denied(Denial::QuotaExceeded(result)));
            }

            results.push(result);
        }

        self.stats.record_allowed();
        Ok(Decision::Allowed(most_restrictive(&results).cloned()))
    }

    fn on_store_failure(
        &self,
        route: &Route,
        identity: &ClientIdentity,
        error: StoreError,
    ) -> Decision {
        self.stats.record_store_failure();

        match self.config.failure_mode {
            FailureMode::Allow => {
                warn!(
                    error = %error,
                    ip = %mask_ip(&identity.ip),
                    path = %route.path,
                    "Counter store failure, allowing request (fail-open)"
                );
                Decision::Allowed(None)
            }
            FailureMode::Deny => {
                warn!(
                    error = %error,
                    ip = %mask_ip(&identity.ip),
                    path = %route.path,
                    "Counter store failure, rejecting request (fail-closed)"
                );
                Decision::Denied(Denial::StoreUnavailable)
            }
        }
    }

    /// Delete every counter and block owned by an IP.
    ///
    /// Idempotent: the next request from the IP starts a fresh window.
    pub async fn clear_ip_limits(&self, ip: IpAddr) -> StoreResult<u64> {
        let ip = ip.to_string();
        let mut deleted = 0;
        for pattern in ip_patterns(&self.config.key_prefix, &ip) {
            deleted += self.store.delete_pattern(&pattern).await?;
        }
        self.ddos.forget(&ip);

        info!(ip = %mask_ip(&ip), deleted = deleted, "Cleared rate limits for IP");
        Ok(deleted)
    }

    /// Delete every counter owned by a user.
    pub async fn clear_user_limits(&self, user_id: u64) -> StoreResult<u64> {
        let mut deleted = 0;
        for pattern in user_patterns(&self.config.key_prefix, user_id) {
            deleted += self.store.delete_pattern(&pattern).await?;
        }

        info!(user_id = user_id, deleted = deleted, "Cleared rate limits for user");
        Ok(deleted)
    }

    /// Current statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// IPs this process has seen blocked by the DDoS guard.
    pub fn blocked_ips(&self) -> Vec<BlockedIp> {
        let blocked = self.ddos.blocked_ips();
        debug!(count = blocked.len(), "Listing blocked IPs");
        blocked
    }
}
