//! HTTP server wiring the rate limiter in front of downstream routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use super::admin::admin_router;
use super::layer::RateLimitLayer;
use crate::config::ServerConfig;
use crate::error::{RatewardenError, Result};
use crate::ratelimit::RateLimiter;

/// HTTP server for a rate limited application.
///
/// Public traffic and the administrative routes are served on separate
/// listeners; the public router never exposes `/admin/*`.
pub struct HttpServer {
    /// Public address to bind to
    addr: SocketAddr,
    /// Listener for `/admin/rate-limits/*`, if enabled
    admin_addr: Option<SocketAddr>,
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
}

impl HttpServer {
    /// Create a new server without administrative routes.
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            admin_addr: None,
            limiter,
        }
    }

    /// Create a server from the `server` section of the configuration.
    pub fn from_config(config: &ServerConfig, limiter: Arc<RateLimiter>) -> Self {
        Self::new(config.listen_addr, limiter).with_admin(config.admin_listener())
    }

    /// Serve the administrative routes on `addr`, or not at all.
    pub fn with_admin(mut self, addr: Option<SocketAddr>) -> Self {
        self.admin_addr = addr;
        self
    }

    /// Wrap `downstream` with rate limiting and add the unlimited health route.
    pub fn router(&self, downstream: Router) -> Router {
        Router::new()
            .route("/health", get(health))
            .merge(downstream.layer(RateLimitLayer::new(self.limiter.clone())))
    }

    /// Router for the administrative listener.
    pub fn admin_router(&self) -> Router {
        admin_router(self.limiter.clone())
    }

    /// Serve `downstream` until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, downstream: Router, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router(downstream);
        let listener = TcpListener::bind(self.addr).await?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let admin = match self.admin_addr {
            Some(addr) => {
                let admin_listener = TcpListener::bind(addr).await?;
                info!(addr = %addr, "Starting admin listener");
                let admin_app = self.admin_router();
                Some(tokio::spawn(async move {
                    axum::serve(admin_listener, admin_app)
                        .with_graceful_shutdown(async move {
                            let _ = stop_rx.changed().await;
                        })
                        .await
                }))
            }
            None => None,
        };

        info!(
            addr = %self.addr,
            admin = self.admin_addr.is_some(),
            "Starting HTTP server with graceful shutdown"
        );

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        let _ = stop_tx.send(true);
        if let Some(admin) = admin {
            match admin.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Admin listener failed"),
                Err(e) => error!(error = %e, "Admin listener task panicked"),
            }
        }

        served.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            RatewardenError::Io(e)
        })
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}
