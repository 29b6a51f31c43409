// src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Called once from `main`. Library code only uses the `tracing` and
//! `metrics` macros and never installs anything itself.

use crate::utils::config::{LogFormat, LoggingConfig, MetricsConfig};
use crate::utils::errors::{RelayError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the config filter.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| RelayError::ObservabilityFailed(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| RelayError::ObservabilityFailed(format!("Tracing init failed: {}", e)))
}

/// Install the Prometheus exporter when enabled. Needs a tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .install()
        .map_err(|e| RelayError::ObservabilityFailed(format!("Metrics exporter failed: {}", e)))?;

    info!("Prometheus metrics exposed on {}", config.listen_addr);
    Ok(())
}
