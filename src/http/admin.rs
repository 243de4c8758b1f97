//! Administrative endpoints for clearing limits and inspecting state.
//!
//! These handlers perform no authorization of their own. They are served only
//! on the separate admin listener, never on the public router.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use http::StatusCode;
use serde::Serialize;
use tracing::warn;

use crate::ratelimit::{mask_ip, BlockedIp, RateLimiter, StatsSnapshot};
use crate::store::StoreError;

#[derive(Debug, Serialize)]
struct Cleared {
    deleted: u64,
}

#[derive(Debug, Serialize)]
struct AdminError {
    error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(AdminError {
            error: message.into(),
        }),
    )
        .into_response()
}

fn store_error(e: StoreError) -> Response {
    warn!(error = %e, "Administrative clear failed");
    error(StatusCode::SERVICE_UNAVAILABLE, "counter store unavailable")
}

/// Routes under `/admin/rate-limits`.
pub fn admin_router(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/admin/rate-limits/ip/{ip}", delete(clear_ip))
        .route("/admin/rate-limits/user/{id}", delete(clear_user))
        .route("/admin/rate-limits/stats", get(stats))
        .route("/admin/rate-limits/blocked", get(blocked))
        .with_state(limiter)
}

async fn clear_ip(State(limiter): State<Arc<RateLimiter>>, Path(ip): Path<String>) -> Response {
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return error(StatusCode::BAD_REQUEST, "invalid IP address");
    };

    match limiter.clear_ip_limits(ip).await {
        Ok(deleted) => Json(Cleared { deleted }).into_response(),
        Err(e) => {
            warn!(ip = %mask_ip(&ip.to_string()), "Failed to clear IP limits");
            store_error(e)
        }
    }
}

async fn clear_user(State(limiter): State<Arc<RateLimiter>>, Path(id): Path<String>) -> Response {
    let Ok(user_id) = id.parse::<u64>() else {
        return error(StatusCode::BAD_REQUEST, "invalid user id");
    };

    match limiter.clear_user_limits(user_id).await {
        Ok(deleted) => Json(Cleared { deleted }).into_response(),
        Err(e) => store_error(e),
    }
}

async fn stats(State(limiter): State<Arc<RateLimiter>>) -> Json<StatsSnapshot> {
    Json(limiter.stats())
}

async fn blocked(State(limiter): State<Arc<RateLimiter>>) -> Json<Vec<BlockedIp>> {
    Json(limiter.blocked_ips())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ClientIdentity, RateLimitConfig, Route};
    use crate::store::InMemoryStore;
    use axum::body::Body;
    use http::Request;
    use tower::ServiceExt;

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(
            Arc::new(RateLimitConfig::default()),
            Arc::new(InMemoryStore::new()),
        ))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_clear_ip() {
        let limiter = limiter();
        limiter
            .check(&Route::new("GET", "/"), &ClientIdentity::anonymous("192.0.2.1"))
            .await;

        let response = admin_router(limiter)
            .oneshot(
                Request::delete("/admin/rate-limits/ip/192.0.2.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        // IP window counter plus the DDoS counter
        assert_eq!(body_json(response).await["deleted"], 2);
    }

    #[tokio::test]
    async fn test_clear_ip_rejects_patterns() {
        let response = admin_router(limiter())
            .oneshot(
                Request::delete("/admin/rate-limits/ip/*")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_clear_user_rejects_non_numeric() {
        let response = admin_router(limiter())
            .oneshot(
                Request::delete("/admin/rate-limits/user/alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats() {
        let limiter = limiter();
        limiter
            .check(&Route::new("GET", "/"), &ClientIdentity::anonymous("192.0.2.1"))
            .await;

        let response = admin_router(limiter)
            .oneshot(
                Request::get("/admin/rate-limits/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["checked"], 1);
        assert_eq!(json["allowed"], 1);
    }

    #[tokio::test]
    async fn test_blocked_empty() {
        let response = admin_router(limiter())
            .oneshot(
                Request::get("/admin/rate-limits/blocked")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }
}
