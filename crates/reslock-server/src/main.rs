//! Resource lock manager server.
//!
//! Run with:
//!   cargo run -p reslock-server -- --database-url sqlite://./resource_locks.db

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use reslock_kernel::{Clock, LeaseManager, SystemClock};
use reslock_runtime::spawn_sweeper;
use reslock_server::{build_router, AppState, ServerConfig};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend = config.backend()?;
    // Store construction may block on schema setup.
    let store = tokio::task::spawn_blocking(move || backend.open())
        .await
        .context("lock store setup task failed")??;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let manager = Arc::new(LeaseManager::with_clock(store, clock));

    let sweeper = spawn_sweeper(Arc::clone(&manager), config.sweep_config());
    if sweeper.is_none() {
        info!("background lease sweep disabled");
    }

    let state = AppState::new(manager).with_max_ttl_seconds(config.max_ttl_seconds);
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!(addr = %config.addr, "resource lock manager listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
