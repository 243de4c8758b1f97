//! Counter key generation and handling.

use std::fmt;
use std::net::IpAddr;

use super::result::LimitType;

/// Delimiter between key segments. Never appears in IPs, numeric user ids or
/// route scopes.
const SEPARATOR: char = '|';

/// A key that identifies one subject's counters for one limit tier.
///
/// Rendered as `{prefix}|{type}|{subject}[|{scope}]`; algorithms append a
/// window index or a bucket marker to the base.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Namespace shared by every key this engine writes
    pub prefix: String,
    /// Limit tier the counters belong to
    pub limit_type: LimitType,
    /// The limited identity: an IP, a user id, or a route scope
    pub subject: String,
    /// Optional route scope for per-endpoint tiers
    pub scope: Option<String>,
}

impl CounterKey {
    /// Create a key for a subject within a tier.
    pub fn new(prefix: &str, limit_type: LimitType, subject: impl Into<String>) -> Self {
        Self {
            prefix: prefix.to_string(),
            limit_type,
            subject: subject.into(),
            scope: None,
        }
    }

    /// Narrow the key to a route scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// The store key shared by all algorithm-specific suffixes.
    pub fn base(&self) -> String {
        let mut key = format!(
            "{}{sep}{}{sep}{}",
            self.prefix,
            self.limit_type.as_str(),
            self.subject,
            sep = SEPARATOR
        );
        if let Some(scope) = &self.scope {
            key.push(SEPARATOR);
            key.push_str(scope);
        }
        key
    }

    /// Store key for the fixed window with the given index.
    pub fn window(&self, index: u64) -> String {
        format!("{}{}{}", self.base(), SEPARATOR, index)
    }

    /// Store key for token bucket state.
    pub fn bucket(&self) -> String {
        format!("{}{}bucket", self.base(), SEPARATOR)
    }

    /// Human-readable key with IP subjects masked, safe for logs.
    pub fn masked(&self) -> String {
        let subject = match self.limit_type {
            LimitType::Ip | LimitType::EndpointIp | LimitType::Ddos => mask_ip(&self.subject),
            _ => self.subject.clone(),
        };
        match &self.scope {
            Some(scope) => format!("{}:{}:{}", self.limit_type, subject, scope),
            None => format!("{}:{}", self.limit_type, subject),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Fold a method and path into a key segment: `GET /api/posts/` becomes
/// `GET:api:posts`.
///
/// Slashes are folded so store glob patterns never have to cross a path
/// separator.
pub fn route_scope(method: &str, path: &str) -> String {
    let path = path.trim_matches('/').replace('/', ":");
    format!("{}:{}", method.to_ascii_uppercase(), path)
}

/// Store key of the DDoS blocked flag for an IP.
pub fn ddos_block_key(prefix: &str, ip: &str) -> String {
    format!("{prefix}{SEPARATOR}ddos_block{SEPARATOR}{ip}")
}

/// Glob patterns covering every counter owned by an IP.
pub fn ip_patterns(prefix: &str, ip: &str) -> Vec<String> {
    let mut patterns: Vec<String> = [LimitType::Ip, LimitType::EndpointIp, LimitType::Ddos]
        .iter()
        .map(|limit_type| subject_pattern(prefix, *limit_type, ip))
        .collect();
    patterns.push(ddos_block_key(prefix, ip));
    patterns
}

/// Glob patterns covering every counter owned by a user.
pub fn user_patterns(prefix: &str, user_id: u64) -> Vec<String> {
    let user_id = user_id.to_string();
    [LimitType::User, LimitType::EndpointUser]
        .iter()
        .map(|limit_type| subject_pattern(prefix, *limit_type, &user_id))
        .collect()
}

fn subject_pattern(prefix: &str, limit_type: LimitType, subject: &str) -> String {
    format!(
        "{prefix}{SEPARATOR}{}{SEPARATOR}{subject}{SEPARATOR}*",
        limit_type.as_str()
    )
}

/// Mask the host part of an IP for logging.
///
/// IPv4 keeps the /24 network, IPv6 keeps the /48 prefix. Anything that does
/// not parse as an IP is redacted entirely.
pub fn mask_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.*")
        }
        Ok(IpAddr::V6(v6)) => {
            let segments = v6.segments();
            format!("{:x}:{:x}:{:x}::*", segments[0], segments[1], segments[2])
        }
        Err(_) if ip == "unknown" => ip.to_string(),
        Err(_) => "<redacted>".to_string(),
    }
}
