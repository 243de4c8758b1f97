//! Rate limit rules configuration and matching.
//!
//! This module holds the process-wide limiting policy: default quotas, the
//! chosen algorithm, per-endpoint and per-tier overrides, allow/deny lists and
//! the DDoS thresholds. It is loaded once at startup and shared read-only.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::algorithm::Algorithm;
use crate::error::{RatewardenError, Result};

/// Tier assumed for callers whose tier is unknown.
pub const DEFAULT_TIER: &str = "free";

/// Behavior when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Fail open: admit the request without rate limit headers.
    #[default]
    Allow,
    /// Fail closed: reject the request.
    Deny,
}

/// A (limit, window) pair a subject must not exceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    /// Requests allowed per window
    pub limit: u64,
    /// Window the limit is measured over
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
    /// Extra capacity above the steady rate (token bucket only)
    #[serde(default)]
    pub burst: u64,
}

impl Quota {
    /// Create a quota without burst allowance.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            burst: 0,
        }
    }

    /// Set the burst allowance.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }
}

/// Limit override for a specific route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointLimit {
    /// Request path, matched exactly
    pub path: String,
    /// HTTP method; when absent the limit applies to every method
    #[serde(default)]
    pub method: Option<String>,
    /// Limit for anonymous callers (and authenticated ones without a variant)
    pub limit: u64,
    /// Window the limit is measured over
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
    /// Burst allowance
    #[serde(default)]
    pub burst: u64,
    /// Distinct limit for authenticated callers
    #[serde(default)]
    pub authenticated_limit: Option<u64>,
}

impl EndpointLimit {
    fn matches(&self, method: &str, path: &str) -> bool {
        self.path == path
            && self
                .method
                .as_deref()
                .map_or(true, |m| m.eq_ignore_ascii_case(method))
    }

    /// Quota applicable to a caller.
    pub fn quota(&self, authenticated: bool) -> Quota {
        let limit = match (authenticated, self.authenticated_limit) {
            (true, Some(limit)) => limit,
            _ => self.limit,
        };
        Quota::new(limit, self.window).with_burst(self.burst)
    }
}

/// Limit override for a user tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTierLimit {
    /// Tier name, e.g. `free` or `premium`
    pub tier: String,
    /// Requests allowed per window
    pub limit: u64,
    /// Window the limit is measured over
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
    /// Burst allowance
    #[serde(default)]
    pub burst: u64,
}

impl UserTierLimit {
    /// The tier's quota.
    pub fn quota(&self) -> Quota {
        Quota::new(self.limit, self.window).with_burst(self.burst)
    }
}

/// A set of IPs and user ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessList {
    /// Client IPs, compared in canonical `IpAddr` form
    #[serde(default)]
    pub ips: HashSet<String>,
    /// Authenticated user ids
    #[serde(default)]
    pub user_ids: HashSet<u64>,
}

impl AccessList {
    /// Reject IP entries that are not addresses.
    pub fn validate(&self, name: &str) -> Result<()> {
        for ip in &self.ips {
            if ip.parse::<IpAddr>().is_err() {
                return Err(RatewardenError::Config(format!(
                    "{name} entry {ip:?} is not an IP address"
                )));
            }
        }
        Ok(())
    }

    /// The list with every IP rewritten to the form request IPs take.
    pub fn canonical(&self) -> Self {
        let ips = self
            .ips
            .iter()
            .map(|ip| match ip.parse::<IpAddr>() {
                Ok(addr) => addr.to_string(),
                Err(_) => ip.clone(),
            })
            .collect();
        Self {
            ips,
            user_ids: self.user_ids.clone(),
        }
    }
}

/// DDoS guard thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosConfig {
    /// Whether the guard runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests per window above which an IP is blocked
    #[serde(default = "default_ddos_threshold")]
    pub threshold: u64,
    /// Window the threshold is measured over
    #[serde(
        default = "default_ddos_window",
        deserialize_with = "deserialize_duration"
    )]
    pub window: Duration,
    /// How long a blocked IP stays blocked
    #[serde(
        default = "default_ddos_block",
        deserialize_with = "deserialize_duration"
    )]
    pub block_duration: Duration,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_ddos_threshold(),
            window: default_ddos_window(),
            block_duration: default_ddos_block(),
        }
    }
}

/// Complete rate limiting policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Master switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Behavior when the counter store is unreachable
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Counting algorithm used for every tier except the DDoS guard
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Namespace for every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Default per-IP quota
    #[serde(default = "default_ip_quota")]
    pub ip: Quota,

    /// Default per-user quota for tiers without an override
    #[serde(default = "default_user_quota")]
    pub user: Quota,

    /// Per-route backstop across all callers; a zero limit disables it
    #[serde(default = "default_endpoint_quota")]
    pub endpoint: Quota,

    /// Burst allowance added to the default quotas
    #[serde(default)]
    pub burst: u64,

    /// Per-route overrides
    #[serde(default)]
    pub endpoints: Vec<EndpointLimit>,

    /// Per-tier overrides for authenticated users
    #[serde(default)]
    pub user_tiers: Vec<UserTierLimit>,

    /// Callers that bypass all limiting
    #[serde(default)]
    pub whitelist: AccessList,

    /// Callers that are always rejected
    #[serde(default)]
    pub blacklist: AccessList,

    /// DDoS guard thresholds
    #[serde(default)]
    pub ddos: DdosConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_mode: FailureMode::default(),
            algorithm: Algorithm::default(),
            key_prefix: default_key_prefix(),
            ip: default_ip_quota(),
            user: default_user_quota(),
            endpoint: default_endpoint_quota(),
            burst: 0,
            endpoints: Vec::new(),
            user_tiers: Vec::new(),
            whitelist: AccessList::default(),
            blacklist: AccessList::default(),
            ddos: DdosConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_ip_quota() -> Quota {
    Quota::new(100, Duration::from_secs(60))
}

fn default_user_quota() -> Quota {
    Quota::new(1000, Duration::from_secs(60))
}

fn default_endpoint_quota() -> Quota {
    Quota::new(0, Duration::from_secs(60))
}

fn default_ddos_threshold() -> u64 {
    1000
}

fn default_ddos_window() -> Duration {
    Duration::from_secs(60)
}

fn default_ddos_block() -> Duration {
    Duration::from_secs(3600)
}

impl RateLimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimitConfig = serde_yaml::from_str(yaml).map_err(|e| {
            RatewardenError::Config(format!("Failed to parse rate limit config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        let quotas = [("ip", &self.ip), ("user", &self.user), ("endpoint", &self.endpoint)];
        for (name, quota) in quotas {
            if quota.window.is_zero() {
                return Err(RatewardenError::Config(format!(
                    "{name} window must be greater than zero"
                )));
            }
        }

        for endpoint in &self.endpoints {
            if endpoint.window.is_zero() {
                return Err(RatewardenError::Config(format!(
                    "endpoint {} window must be greater than zero",
                    endpoint.path
                )));
            }
        }

        for tier in &self.user_tiers {
            if tier.window.is_zero() {
                return Err(RatewardenError::Config(format!(
                    "tier {} window must be greater than zero",
                    tier.tier
                )));
            }
        }

        self.whitelist.validate("whitelist")?;
        self.blacklist.validate("blacklist")?;

        if self.ddos.enabled
            && (self.ddos.threshold == 0
                || self.ddos.window.is_zero()
                || self.ddos.block_duration.is_zero())
        {
            return Err(RatewardenError::Config(
                "ddos threshold, window and block_duration must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Default per-IP quota including the burst allowance.
    pub fn ip_quota(&self) -> Quota {
        self.ip.clone().with_burst(self.ip.burst.max(self.burst))
    }

    /// Find the override for a route: an exact method+path entry wins over a
    /// path-only entry.
    pub fn endpoint_limit(&self, method: &str, path: &str) -> Option<&EndpointLimit> {
        self.endpoints
            .iter()
            .filter(|e| e.matches(method, path))
            .max_by_key(|e| e.method.is_some())
    }

    /// Quota for a user tier, falling back to the default user quota.
    pub fn tier_quota(&self, tier: &str) -> Quota {
        self.user_tiers
            .iter()
            .find(|t| t.tier == tier)
            .map(UserTierLimit::quota)
            .unwrap_or_else(|| self.user.clone().with_burst(self.user.burst.max(self.burst)))
    }

    /// Per-route backstop quota, if enabled.
    pub fn global_endpoint_quota(&self) -> Option<Quota> {
        (self.endpoint.limit > 0)
            .then(|| self.endpoint.clone().with_burst(self.endpoint.burst.max(self.burst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
enabled: true
failure_mode: deny
algorithm: token_bucket
ip:
  limit: 100
  window: 1m
user:
  limit: 500
  window: 1m
endpoint:
  limit: 2000
  window: 1m
burst: 10
endpoints:
  - path: /api/posts
    method: POST
    limit: 5
    window: 1m
    authenticated_limit: 20
  - path: /api/posts
    limit: 50
    window: 1m
user_tiers:
  - tier: premium
    limit: 5000
    window: 1m
    burst: 100
whitelist:
  ips: ["10.0.0.1"]
  user_ids: [1]
blacklist:
  ips: ["203.0.113.9"]
ddos:
  threshold: 300
  window: 10s
  block_duration: 15m
"#;

    #[test]
    fn test_parse_full_config() {
        let config = RateLimitConfig::from_yaml(SAMPLE).unwrap();

        assert!(config.enabled);
        assert_eq!(config.failure_mode, FailureMode::Deny);
        assert_eq!(config.algorithm, Algorithm::TokenBucket);
        assert_eq!(config.ip, Quota::new(100, Duration::from_secs(60)));
        assert_eq!(config.endpoints.len(), 2);
        assert!(config.whitelist.ips.contains("10.0.0.1"));
        assert!(config.whitelist.user_ids.contains(&1));
        assert!(config.blacklist.ips.contains("203.0.113.9"));
        assert_eq!(config.ddos.threshold, 300);
        assert_eq!(config.ddos.window, Duration::from_secs(10));
        assert_eq!(config.ddos.block_duration, Duration::from_secs(900));
    }

    #[test]
    fn test_defaults_for_empty_config() {
        let config = RateLimitConfig::from_yaml("{}").unwrap();

        assert!(config.enabled);
        assert_eq!(config.failure_mode, FailureMode::Allow);
        assert_eq!(config.algorithm, Algorithm::SlidingWindow);
        assert_eq!(config.key_prefix, "ratelimit");
        assert_eq!(config.ip.limit, 100);
        assert!(config.global_endpoint_quota().is_none());
        assert!(config.ddos.enabled);
    }

    #[test]
    fn test_endpoint_limit_prefers_method_match() {
        let config = RateLimitConfig::from_yaml(SAMPLE).unwrap();

        let post = config.endpoint_limit("post", "/api/posts").unwrap();
        assert_eq!(post.limit, 5);

        let get = config.endpoint_limit("GET", "/api/posts").unwrap();
        assert_eq!(get.limit, 50);

        assert!(config.endpoint_limit("GET", "/api/jobs").is_none());
    }

    #[test]
    fn test_endpoint_quota_for_authenticated_callers() {
        let config = RateLimitConfig::from_yaml(SAMPLE).unwrap();
        let post = config.endpoint_limit("POST", "/api/posts").unwrap();

        assert_eq!(post.quota(true).limit, 20);
        assert_eq!(post.quota(false).limit, 5);

        // No authenticated variant: everyone gets the anonymous limit
        let any = config.endpoint_limit("GET", "/api/posts").unwrap();
        assert_eq!(any.quota(true).limit, 50);
    }

    #[test]
    fn test_tier_quota_falls_back_to_default() {
        let config = RateLimitConfig::from_yaml(SAMPLE).unwrap();

        let premium = config.tier_quota("premium");
        assert_eq!(premium.limit, 5000);
        assert_eq!(premium.burst, 100);

        let free = config.tier_quota(DEFAULT_TIER);
        assert_eq!(free.limit, 500);
        assert_eq!(free.burst, 10);
    }

    #[test]
    fn test_global_endpoint_quota() {
        let config = RateLimitConfig::from_yaml(SAMPLE).unwrap();
        let quota = config.global_endpoint_quota().unwrap();
        assert_eq!(quota.limit, 2000);
    }

    #[test]
    fn test_reject_zero_window() {
        let yaml = r#"
ip:
  limit: 10
  window: 0s
"#;
        assert!(RateLimitConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_reject_zero_ddos_threshold() {
        let yaml = r#"
ddos:
  threshold: 0
"#;
        assert!(RateLimitConfig::from_yaml(yaml).is_err());

        let disabled = r#"
ddos:
  enabled: false
  threshold: 0
"#;
        assert!(RateLimitConfig::from_yaml(disabled).is_ok());
    }

    #[test]
    fn test_reject_malformed_access_list_ip() {
        for yaml in [
            "blacklist:\n  ips: [\"10.0.0.300\"]",
            "whitelist:\n  ips: [\"not-an-ip\"]",
            "blacklist:\n  ips: [\"10.0.0.0/8\"]",
        ] {
            match RateLimitConfig::from_yaml(yaml) {
                Err(RatewardenError::Config(msg)) => assert!(msg.contains("not an IP address")),
                other => panic!("expected config error for {yaml:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_invalid_yaml() {
        assert!(RateLimitConfig::from_yaml("ip: [not, a, quota]").is_err());
    }
}
