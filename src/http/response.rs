//! Rate limit headers and denial responses.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::RETRY_AFTER;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;

use crate::ratelimit::{Denial, RateLimitResult};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_TYPE: HeaderName = HeaderName::from_static("x-ratelimit-type");

/// Machine-readable error codes carried in denial bodies.
pub mod codes {
    pub const ACCESS_DENIED: &str = "ACCESS_DENIED";
    pub const DDOS_PROTECTION: &str = "DDOS_PROTECTION";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const RATE_LIMIT_UNAVAILABLE: &str = "RATE_LIMIT_UNAVAILABLE";
}

/// Set the `X-RateLimit-*` headers for a result, plus `Retry-After` when the
/// result is a denial.
pub fn apply_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(result.remaining),
    );
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(result.reset_at));
    headers.insert(
        X_RATELIMIT_TYPE,
        HeaderValue::from_static(result.limit_type.as_str()),
    );

    if !result.allowed {
        if let Some(secs) = result.retry_after_secs() {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
}

/// Status code, error code and message for a denial.
pub fn describe(denial: &Denial) -> (StatusCode, &'static str, String) {
    match denial {
        Denial::Blacklisted => (
            StatusCode::FORBIDDEN,
            codes::ACCESS_DENIED,
            "Access denied".to_string(),
        ),
        Denial::Ddos(result) => (
            StatusCode::FORBIDDEN,
            codes::DDOS_PROTECTION,
            format!(
                "Too many requests from this address. Blocked for {} seconds.",
                result.retry_after_secs().unwrap_or(0)
            ),
        ),
        Denial::QuotaExceeded(result) => (
            StatusCode::TOO_MANY_REQUESTS,
            codes::RATE_LIMIT_EXCEEDED,
            format!(
                "Rate limit exceeded for {} limit. Try again in {} seconds.",
                result.limit_type,
                result.retry_after_secs().unwrap_or(0)
            ),
        ),
        Denial::StoreUnavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            codes::RATE_LIMIT_UNAVAILABLE,
            "Rate limiting is temporarily unavailable".to_string(),
        ),
    }
}

/// Build the short-circuit response for a denial.
pub fn denial_response(denial: &Denial) -> Response<Body> {
    let (status, kind, message) = describe(denial);
    let body = ErrorBody {
        error: ErrorDetail { kind, message },
        timestamp: chrono::Utc::now().timestamp(),
    };

    let mut response = (status, Json(body)).into_response();
    if let Some(result) = denial.result() {
        apply_headers(response.headers_mut(), result);
    }
    response
}
