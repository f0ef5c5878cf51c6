//! ferryd — Ferry file server daemon.

use std::time::Duration;

use anyhow::{Context, Result};

use ferry_core::config::FerryConfig;
use ferry_engine::FileServer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = FerryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FerryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });
    config
        .ensure_roots()
        .context("failed to create root directories")?;

    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("port must be a number")?,
        None => config.server.port,
    };
    tracing::info!(port, root = %config.server.root_path.display(), "ferryd starting");

    let mut server = FileServer::new(config.server.clone()).context("failed to build server")?;
    let addr = server.start(port).await.context("failed to start server")?;

    // ── Connection snapshot ──────────────────────────────────────────────────

    let snapshot = {
        let registry = server.registry().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !registry.is_empty() {
                    tracing::info!(count = registry.len(), peers = ?registry.peers(), "active connections");
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!(addr = %addr, "shutdown signal received");

    snapshot.abort();
    server.shutdown();
    Ok(())
}
