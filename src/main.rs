// src/main.rs
//! Reading Relay
//!
//! Standalone relay process: loads configuration, opens the local
//! annotation store and capture sink, and serves devices until Ctrl+C.

use anyhow::{Context, Result};
use reading_relay::capture::{CaptureSink, SqliteSink, TracingSink};
use reading_relay::emulation::SqliteAnnotationStore;
use reading_relay::observability::{init_metrics, init_tracing};
use reading_relay::relay::{RelayOrchestrator, RelayServer, StaticTokenResolver};
use reading_relay::utils::config::{RelayConfig, SinkKind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    info!("Starting Reading Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Upstream: {}", config.upstream.base_url);

    let store = Arc::new(
        SqliteAnnotationStore::open(&config.store.sqlite_path)
            .context("Failed to open annotation store")?,
    );

    let sink: Arc<dyn CaptureSink> = match config.capture.sink {
        SinkKind::Tracing => Arc::new(TracingSink),
        SinkKind::Sqlite => Arc::new(
            SqliteSink::open(&config.capture.sqlite_path).context("Failed to open capture sink")?,
        ),
    };

    let identity = Arc::new(StaticTokenResolver::new(config.identity.tokens.clone()));
    info!("{} device tokens configured", config.identity.tokens.len());

    let orchestrator = Arc::new(RelayOrchestrator::from_config(&config, store, identity, sink)?);
    let recorder = Arc::clone(orchestrator.recorder());
    let server = Arc::new(
        RelayServer::new(orchestrator).with_drain_timeout(config.server.drain_timeout()),
    );

    // Graceful shutdown handler
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal, cleaning up...");
        signal.cancel();
    });

    let result = server.bind_and_serve(config.server.listen_addr, shutdown).await;
    recorder.shutdown().await;

    match result {
        Ok(()) => {
            info!("Relay stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Relay error: {}", e);
            Err(e.into())
        }
    }
}
