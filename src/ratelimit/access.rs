//! Static allow and deny lists.

use super::resolver::ClientIdentity;
use super::rules::{AccessList, RateLimitConfig};

/// Whitelist and blacklist evaluated before any counting.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    whitelist: AccessList,
    blacklist: AccessList,
}

impl AccessControl {
    /// Build from the configured lists.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            whitelist: config.whitelist.canonical(),
            blacklist: config.blacklist.canonical(),
        }
    }

    /// Match a canonical IP against the blacklist.
    pub fn is_blacklisted_ip(&self, ip: &str) -> bool {
        self.blacklist.ips.contains(ip)
    }

    /// Whether the caller's IP or user id is blacklisted.
    pub fn is_blacklisted(&self, identity: &ClientIdentity) -> bool {
        self.is_blacklisted_ip(&identity.ip)
            || identity
                .user_id
                .is_some_and(|id| self.blacklist.user_ids.contains(&id))
    }

    /// Whether the caller's IP or user id is whitelisted.
    pub fn is_whitelisted(&self, identity: &ClientIdentity) -> bool {
        self.whitelist.ips.contains(&identity.ip)
            || identity
                .user_id
                .is_some_and(|id| self.whitelist.user_ids.contains(&id))
    }
}
