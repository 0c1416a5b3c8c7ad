//! safetrack-live - live location presence service
//!
//! Serves the per-event presence store over HTTP: attendees PUT their latest
//! position, dashboards GET or stream the staleness-filtered active view.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use safetrack_common::presence::InMemoryPresenceStore;
use safetrack_common::time::SystemClock;
use safetrack_common::PresenceConfig;
use safetrack_live::{build_router, AppState};

/// Command-line arguments for safetrack-live
#[derive(Parser, Debug)]
#[command(name = "safetrack-live")]
#[command(about = "Live location presence service for SafeTrack events")]
#[command(version)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides bind_address from config)
    #[arg(short, long, env = "SAFETRACK_BIND")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config decides the default log level, so load it before tracing is up
    let config = PresenceConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},tower_http=info", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SafeTrack live presence (safetrack-live) v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Stale threshold {} ms, refilter interval {} ms",
        config.stale_threshold_ms, config.refilter_interval_ms
    );

    let addr = match args.bind {
        Some(addr) => addr,
        None => config
            .bind_address
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid bind_address: {}", config.bind_address))?,
    };

    let store = Arc::new(InMemoryPresenceStore::new());
    let state = AppState::new(store.clone(), Arc::new(SystemClock), config);
    let app = build_router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Ends open SSE streams so graceful shutdown can complete
            store.shutdown();
        })
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
