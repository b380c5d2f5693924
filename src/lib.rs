//! relaymedic -- batch health testing for upstream AI model channels.
//!
//! This crate provides the channel store, the single-probe HTTP tester, the
//! concurrent batch job runner with its in-process registry, and a thin HTTP
//! API over all of it.

pub mod api;
pub mod channel;
pub mod config;
pub mod jobs;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::jobs::{JobRegistry, JobRunner, RunnerSettings};

/// Open storage and build the runner stack.
///
/// Does not run the startup recovery sweep: the CLI shares the daemon's
/// database and must never fail jobs the daemon is executing.
pub fn build_registry(config: &RelayConfig) -> Result<JobRegistry> {
    tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;

    let tester = channel::HttpChannelTester::new(&config.tester)?;
    let runner = JobRunner::new(
        storage::JobStore::new(pool.clone()),
        storage::ChannelStore::new(pool),
        Arc::new(tester),
        RunnerSettings::from_config(&config.jobs),
    );
    Ok(JobRegistry::new(runner))
}

/// Start the relaymedic daemon: recovery sweep, API server, job registry.
pub async fn serve(config: RelayConfig) -> Result<()> {
    let registry = build_registry(&config)?;
    registry
        .initialize()
        .await
        .context("Startup recovery sweep failed")?;

    let state = api::state::AppState::new(registry.clone(), config.jobs.clone());
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relaymedic listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    let canceled = registry.shutdown().await;
    tracing::info!(canceled, "Running jobs finalized, exiting");
    Ok(())
}
