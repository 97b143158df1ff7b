//! metricwatch -- anomaly detection, event grouping and prioritization for
//! infrastructure metrics.
//!
//! Series are scored by a pluggable detector, flagged points are clustered
//! into events (continuing events stored by earlier requests), and events are
//! ranked by a composite priority for alerting.

pub mod api;
pub mod config;
pub mod detect;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::detect::DetectorRegistry;
use crate::pipeline::Pipeline;

/// Validate `config` and wire the registry, store and pipeline together.
pub fn build_pipeline(config: Config) -> Result<Pipeline> {
    config.validate().context("invalid configuration")?;
    let registry = Arc::new(DetectorRegistry::from_config(&config.detectors));
    let store = storage::open_store(&config.storage)?;
    Pipeline::new(Arc::new(config), registry, store)
}

/// Start the metricwatch daemon: HTTP API over the detection pipeline.
pub async fn serve(config: Config, bind: Option<&str>) -> Result<()> {
    let bind = bind.unwrap_or(config.server.bind.as_str()).to_string();
    let pipeline = build_pipeline(config)?;

    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let app = api::router(api::state::AppState::new(pipeline));

    tracing::info!(%addr, "metricwatch listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("metricwatch stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
