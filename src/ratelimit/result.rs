//! Per-check rate limit results.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which tier of limiting produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// Per client IP
    Ip,
    /// Per authenticated user
    User,
    /// Per endpoint, keyed by authenticated user
    EndpointUser,
    /// Per endpoint, keyed by client IP
    EndpointIp,
    /// Per endpoint across all callers
    GlobalEndpoint,
    /// Abuse threshold per client IP
    Ddos,
}

impl LimitType {
    /// Stable tag used in counter keys, headers and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Ip => "ip",
            LimitType::User => "user",
            LimitType::EndpointUser => "endpoint_user",
            LimitType::EndpointIp => "endpoint_ip",
            LimitType::GlobalEndpoint => "global_endpoint",
            LimitType::Ddos => "ddos",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single rate limit check. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    /// Whether the check admitted the request
    pub allowed: bool,
    /// Quota limit for the check
    pub limit: u64,
    /// Remaining capacity after this request, never negative
    pub remaining: u64,
    /// Unix timestamp (seconds) at which capacity is restored
    pub reset_at: u64,
    /// How long to wait before retrying, set on denial
    pub retry_after: Option<Duration>,
    /// The tier that produced this result
    pub limit_type: LimitType,
    /// Loggable key with identities masked
    pub limit_key: String,
}

impl RateLimitResult {
    /// Retry-after rounded up to whole seconds, at least one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| {
            let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
            secs.max(1)
        })
    }
}

/// Select the passing result with the least remaining capacity.
///
/// Ties keep the earliest result, which preserves check order.
pub fn most_restrictive(results: &[RateLimitResult]) -> Option<&RateLimitResult> {
    results.iter().reduce(|best, candidate| {
        if candidate.remaining < best.remaining {
            candidate
        } else {
            best
        }
    })
}
