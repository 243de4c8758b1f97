//! Limit resolution: which quotas apply to a request.

use std::sync::Arc;

use super::key::{route_scope, CounterKey};
use super::result::LimitType;
use super::rules::{Quota, RateLimitConfig, DEFAULT_TIER};

/// Scope used for endpoint overrides that apply to every method.
const ANY_METHOD: &str = "ANY";

/// The route a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// HTTP method, e.g. `GET`
    pub method: String,
    /// Request path without the query string
    pub path: String,
}

impl Route {
    /// Create a route.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
        }
    }
}

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Client IP in canonical form, or `unknown`
    pub ip: String,
    /// Authenticated user id; `None` for anonymous callers
    pub user_id: Option<u64>,
    /// User tier, `free` when unknown
    pub tier: String,
}

impl ClientIdentity {
    /// An anonymous caller identified only by IP.
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id: None,
            tier: DEFAULT_TIER.to_string(),
        }
    }

    /// An authenticated caller. A user id of zero is treated as anonymous.
    pub fn authenticated(ip: impl Into<String>, user_id: u64, tier: Option<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id: (user_id != 0).then_some(user_id),
            tier: tier
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_TIER.to_string()),
        }
    }

    /// Whether the caller is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// One quota to enforce for a request.
#[derive(Debug, Clone)]
pub struct LimitCheck {
    /// Counter key for the subject
    pub key: CounterKey,
    /// Quota the subject must stay within
    pub quota: Quota,
}

/// Maps a request to the ordered list of checks it must pass.
#[derive(Debug, Clone)]
pub struct LimitResolver {
    config: Arc<RateLimitConfig>,
}

impl LimitResolver {
    /// Create a resolver over the given configuration.
    pub fn new(config: Arc<RateLimitConfig>) -> Self {
        Self { config }
    }

    /// Resolve checks in enforcement order: IP, user, endpoint, global endpoint.
    pub fn resolve(&self, route: &Route, identity: &ClientIdentity) -> Vec<LimitCheck> {
        let config = &self.config;
        let prefix = config.key_prefix.as_str();
        let mut checks = Vec::with_capacity(4);

        checks.push(LimitCheck {
            key: CounterKey::new(prefix, LimitType::Ip, identity.ip.as_str()),
            quota: config.ip_quota(),
        });

        if let Some(user_id) = identity.user_id {
            checks.push(LimitCheck {
                key: CounterKey::new(prefix, LimitType::User, user_id.to_string()),
                quota: config.tier_quota(&identity.tier),
            });
        }

        if let Some(endpoint) = config.endpoint_limit(&route.method, &route.path) {
            let method = endpoint.method.as_deref().unwrap_or(ANY_METHOD);
            let scope = route_scope(method, &endpoint.path);

            // Authenticated and anonymous callers never share a counter.
            let key = match identity.user_id {
                Some(user_id) => {
                    CounterKey::new(prefix, LimitType::EndpointUser, user_id.to_string())
                }
                None => CounterKey::new(prefix, LimitType::EndpointIp, identity.ip.as_str()),
            };

            checks.push(LimitCheck {
                key: key.with_scope(scope),
                quota: endpoint.quota(identity.is_authenticated()),
            });
        }

        if let Some(quota) = config.global_endpoint_quota() {
            checks.push(LimitCheck {
                key: CounterKey::new(
                    prefix,
                    LimitType::GlobalEndpoint,
                    route_scope(&route.method, &route.path),
                ),
                quota,
            });
        }

        checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(yaml: &str) -> LimitResolver {
        LimitResolver::new(Arc::new(RateLimitConfig::from_yaml(yaml).unwrap()))
    }

    const CONFIG: &str = r#"
ip:
  limit: 100
  window: 1m
user:
  limit: 300
  window: 1m
endpoint:
  limit: 5000
  window: 1m
endpoints:
  - path: /api/posts
    method: POST
    limit: 5
    window: 1m
    authenticated_limit: 20
user_tiers:
  - tier: premium
    limit: 3000
    window: 1m
"#;

    fn types(checks: &[LimitCheck]) -> Vec<LimitType> {
        checks.iter().map(|c| c.key.limit_type).collect()
    }

    #[test]
    fn test_anonymous_request_without_override() {
        let resolver = resolver(CONFIG);
        let checks = resolver.resolve(
            &Route::new("GET", "/api/posts"),
            &ClientIdentity::anonymous("10.0.0.1"),
        );

        assert_eq!(types(&checks), vec![LimitType::Ip, LimitType::GlobalEndpoint]);
        assert_eq!(checks[0].quota.limit, 100);
        assert_eq!(checks[1].key.subject, "GET:api:posts");
        assert_eq!(checks[1].quota.limit, 5000);
    }

    #[test]
    fn test_authenticated_request_with_override() {
        let resolver = resolver(CONFIG);
        let identity = ClientIdentity::authenticated("10.0.0.1", 42, Some("premium".into()));
        let checks = resolver.resolve(&Route::new("POST", "/api/posts"), &identity);

        assert_eq!(
            types(&checks),
            vec![
                LimitType::Ip,
                LimitType::User,
                LimitType::EndpointUser,
                LimitType::GlobalEndpoint
            ]
        );
        assert_eq!(checks[1].quota.limit, 3000);
        assert_eq!(checks[2].quota.limit, 20);
        assert_eq!(checks[2].key.base(), "ratelimit|endpoint_user|42|POST:api:posts");
    }

    #[test]
    fn test_anonymous_endpoint_check_keyed_by_ip() {
        let resolver = resolver(CONFIG);
        let checks = resolver.resolve(
            &Route::new("POST", "/api/posts"),
            &ClientIdentity::anonymous("10.0.0.1"),
        );

        let endpoint = &checks[1];
        assert_eq!(endpoint.key.limit_type, LimitType::EndpointIp);
        assert_eq!(endpoint.key.subject, "10.0.0.1");
        assert_eq!(endpoint.quota.limit, 5);
    }

    #[test]
    fn test_unknown_tier_uses_default_user_quota() {
        let resolver = resolver(CONFIG);
        let identity = ClientIdentity::authenticated("10.0.0.1", 7, None);
        assert_eq!(identity.tier, DEFAULT_TIER);

        let checks = resolver.resolve(&Route::new("GET", "/"), &identity);
        assert_eq!(checks[1].key.limit_type, LimitType::User);
        assert_eq!(checks[1].quota.limit, 300);
    }

    #[test]
    fn test_user_id_zero_is_anonymous() {
        let identity = ClientIdentity::authenticated("10.0.0.1", 0, Some("premium".into()));
        assert!(!identity.is_authenticated());
    }

    #[test]
    fn test_global_endpoint_disabled_by_default() {
        let resolver = resolver("{}");
        let checks = resolver.resolve(
            &Route::new("GET", "/api/posts"),
            &ClientIdentity::anonymous("10.0.0.1"),
        );
        assert_eq!(types(&checks), vec![LimitType::Ip]);
    }

    #[test]
    fn test_method_less_override_shares_scope() {
        let resolver = resolver(
            r#"
endpoints:
  - path: /api/search
    limit: 10
    window: 10s
"#,
        );
        let identity = ClientIdentity::anonymous("10.0.0.1");
        let get = resolver.resolve(&Route::new("GET", "/api/search"), &identity);
        let post = resolver.resolve(&Route::new("POST", "/api/search"), &identity);

        assert_eq!(get[1].key, post[1].key);
        assert_eq!(get[1].key.scope.as_deref(), Some("ANY:api:search"));
    }
}
