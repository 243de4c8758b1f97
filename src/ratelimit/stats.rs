//! In-memory limiter statistics. Reset on restart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::result::LimitType;

const LIMIT_TYPES: [LimitType; 6] = [
    LimitType::Ip,
    LimitType::User,
    LimitType::EndpointUser,
    LimitType::EndpointIp,
    LimitType::GlobalEndpoint,
    LimitType::Ddos,
];

fn slot(limit_type: LimitType) -> usize {
    match limit_type {
        LimitType::Ip => 0,
        LimitType::User => 1,
        LimitType::EndpointUser => 2,
        LimitType::EndpointIp => 3,
        LimitType::GlobalEndpoint => 4,
        LimitType::Ddos => 5,
    }
}

/// Counters updated on every decision.
#[derive(Debug, Default)]
pub struct LimiterStats {
    checked: AtomicU64,
    allowed: AtomicU64,
    bypassed: AtomicU64,
    blacklisted: AtomicU64,
    store_failures: AtomicU64,
    denied: [AtomicU64; 6],
}

impl LimiterStats {
    pub fn record_checked(&self) {
        self.checked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypassed(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blacklisted(&self) {
        self.blacklisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self, limit_type: LimitType) {
        self.denied[slot(limit_type)].fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let denied = LIMIT_TYPES
            .iter()
            .map(|t| (t.to_string(), self.denied[slot(*t)].load(Ordering::Relaxed)))
            .collect();

        StatsSnapshot {
            checked: self.checked.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            blacklisted: self.blacklisted.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            denied,
        }
    }
}

/// Serializable view of [`LimiterStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub checked: u64,
    pub allowed: u64,
    pub bypassed: u64,
    pub blacklisted: u64,
    pub store_failures: u64,
    /// Denials per limit type
    pub denied: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    /// Total quota and DDoS denials.
    pub fn total_denied(&self) -> u64 {
        self.denied.values().sum()
    }
}
