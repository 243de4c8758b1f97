//! Client identity extraction from inbound requests.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use http::{HeaderMap, Request};

use crate::ratelimit::{ClientIdentity, Route};

/// IP reported when no source yields a parseable address.
pub const UNKNOWN_IP: &str = "unknown";

/// Authenticated caller, inserted as a request extension by the upstream
/// authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// User id; zero means anonymous
    pub id: u64,
    /// Subscription tier, if known
    pub tier: Option<String>,
}

impl AuthenticatedUser {
    pub fn new(id: u64) -> Self {
        Self { id, tier: None }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }
}

/// Derive the caller's identity. Never fails; missing pieces degrade to
/// IP-only limiting.
pub fn extract_identity<B>(req: &Request<B>) -> ClientIdentity {
    let ip = client_ip(req);

    match req.extensions().get::<AuthenticatedUser>() {
        Some(user) => ClientIdentity::authenticated(ip, user.id, user.tier.clone()),
        None => ClientIdentity::anonymous(ip),
    }
}

/// The route a request targets.
pub fn extract_route<B>(req: &Request<B>) -> Route {
    Route::new(req.method().as_str(), req.uri().path())
}

/// Client IP in canonical form: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the peer address.
pub fn client_ip<B>(req: &Request<B>) -> String {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|connect_info| connect_info.0.ip());

    resolve_ip(req.headers(), peer)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

fn resolve_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    forwarded_for(headers)
        .or_else(|| header_ip(headers, "x-real-ip"))
        .or(peer)
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    value.split(',').next()?.trim().parse().ok()
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request() -> http::request::Builder {
        Request::builder().uri("/api/posts?page=2")
    }

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let req = request()
            .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
            .header("x-real-ip", "198.51.100.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "203.0.113.5");
    }

    #[test]
    fn test_real_ip_fallback() {
        let req = request()
            .header("x-real-ip", " 198.51.100.1 ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "198.51.100.1");
    }

    #[test]
    fn test_garbage_header_falls_through_to_peer() {
        let mut req = request()
            .header("x-forwarded-for", "rl|ip|*")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 10], 51000))));
        assert_eq!(client_ip(&req), "192.0.2.10");
    }

    #[test]
    fn test_unknown_without_any_source() {
        let req = request().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&req), UNKNOWN_IP);
    }

    #[test]
    fn test_ipv6_is_canonicalized() {
        let req = request()
            .header("x-real-ip", "2001:DB8:0:0::1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "2001:db8::1");
    }

    #[test]
    fn test_identity_from_extension() {
        let mut req = request()
            .header("x-real-ip", "198.51.100.1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(AuthenticatedUser::new(42).with_tier("premium"));

        let identity = extract_identity(&req);
        assert_eq!(identity.user_id, Some(42));
        assert_eq!(identity.tier, "premium");
    }

    #[test]
    fn test_anonymous_identity() {
        let mut req = request().body(Body::empty()).unwrap();
        req.extensions_mut().insert(AuthenticatedUser::new(0));

        let identity = extract_identity(&req);
        assert_eq!(identity.ip, UNKNOWN_IP);
        assert_eq!(identity.user_id, None);
        assert_eq!(identity.tier, "free");
    }

    #[test]
    fn test_route_drops_query() {
        let req = Request::post("/api/posts?draft=1").body(Body::empty()).unwrap();
        assert_eq!(extract_route(&req), Route::new("POST", "/api/posts"));
    }
}
