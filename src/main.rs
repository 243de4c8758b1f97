use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::StatusCode;
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LoggingConfig, ServiceConfig, StorageConfig};
use ratewarden::http::HttpServer;
use ratewarden::ratelimit::RateLimiter;
use ratewarden::store::{self, CounterStore, InMemoryStore};

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about = "Multi-tier rate limiting service")]
struct Cli {
    /// YAML configuration file; `RATEWARDEN__*` variables override it
    #[arg(short, long, global = true, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Delete every counter and block for an IP
    ClearIp {
        ip: IpAddr,
    },
    /// Delete every counter for a user
    ClearUser {
        user_id: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config =
        ServiceConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    init_tracing(&config.logging);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::ClearIp { ip } => {
            let limiter = build_limiter(&config).await?;
            let deleted = limiter.clear_ip_limits(ip).await?;
            println!("Cleared {deleted} counters");
            Ok(())
        }
        Command::ClearUser { user_id } => {
            let limiter = build_limiter(&config).await?;
            let deleted = limiter.clear_user_limits(user_id).await?;
            println!("Cleared {deleted} counters for user {user_id}");
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_limiter(config: &ServiceConfig) -> anyhow::Result<RateLimiter> {
    let store = store::connect(&config.storage)
        .await
        .context("Failed to open counter store")?;
    Ok(RateLimiter::new(Arc::new(config.rate_limiting.clone()), store))
}

async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    info!("Starting Ratewarden Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = ?config.server.admin_listener(),
        algorithm = %config.rate_limiting.algorithm,
        failure_mode = ?config.rate_limiting.failure_mode,
        "Configuration loaded"
    );

    let (store, sweeper): (Arc<dyn CounterStore>, _) = match &config.storage {
        StorageConfig::Memory { sweep_interval } => {
            let store = Arc::new(InMemoryStore::new());
            let sweeper = tokio::spawn(sweep_expired(store.clone(), *sweep_interval));
            let store: Arc<dyn CounterStore> = store;
            (store, Some(sweeper))
        }
        StorageConfig::Redis { .. } => {
            let store = store::connect(&config.storage)
                .await
                .context("Failed to open counter store")?;
            (store, None)
        }
    };

    let limiter = Arc::new(RateLimiter::new(
        Arc::new(config.rate_limiting.clone()),
        store,
    ));
    info!("Rate limiter initialized");

    // Application routes are mounted by the embedding service; standalone,
    // everything behind the limiter answers 404.
    let downstream = Router::new().fallback(|| async {
        (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
    });

    HttpServer::from_config(&config.server, limiter)
        .serve_with_shutdown(downstream, shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Ratewarden Rate Limiting Service stopped");
    Ok(())
}

/// Periodically drop expired counters from the in-memory store.
async fn sweep_expired(store: Arc<InMemoryStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        store.purge_expired();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
