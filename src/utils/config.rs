// src/utils/config.rs
//! Relay configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `relay.{toml,yaml,json}` file (path overridable through
//! `READING_RELAY_CONFIG`), then `READING_RELAY__SECTION__KEY` environment
//! variables.

use crate::utils::errors::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "READING_RELAY_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "READING_RELAY";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub emulation: EmulationConfig,
    pub capture: CaptureConfig,
    pub store: StoreConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Inbound HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// First path segment the relay answers to (`/{service}/{token}/...`)
    pub service: String,

    /// How long shutdown waits for in-flight requests (milliseconds)
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8083)),
            service: "readingservices".to_string(),
            drain_timeout_ms: 15_000,
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Remote vendor service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL, no trailing slash
    pub base_url: String,

    /// TCP/TLS connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Whole-exchange deadline (milliseconds)
    pub deadline_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://readingservices.kobo.com".to_string(),
            connect_timeout_ms: 2_000,
            deadline_ms: 10_000,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Local emulation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulationConfig {
    /// Master switch; when off every request is forwarded
    pub enabled: bool,

    /// A record set whose newest entry is older than this is stale.
    /// `None` disables the staleness check.
    pub max_record_age_secs: Option<u64>,

    /// Page size when the device sends no `limit`
    pub default_page_size: usize,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_record_age_secs: None,
            default_page_size: 100,
        }
    }
}

impl EmulationConfig {
    pub fn max_record_age(&self) -> Option<Duration> {
        self.max_record_age_secs.map(Duration::from_secs)
    }
}

/// Where captured exchanges go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Tracing,
    Sqlite,
}

/// Exchange capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Enable capture
    pub enabled: bool,

    /// Bounded queue capacity; records beyond it are dropped
    pub queue_capacity: usize,

    /// Background writer flush interval (milliseconds)
    pub flush_interval_ms: u64,

    /// Exchanges per sink write
    pub batch_size: usize,

    /// Sink implementation
    pub sink: SinkKind,

    /// Database file for the SQLite sink
    pub sqlite_path: PathBuf,

    /// Header names masked in addition to the built-in policy
    pub extra_redacted_headers: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 10_000,
            flush_interval_ms: 100,
            batch_size: 100,
            sink: SinkKind::Tracing,
            sqlite_path: PathBuf::from("capture.db"),
            extra_redacted_headers: Vec::new(),
        }
    }
}

/// Local annotation store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub sqlite_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("annotations.db"),
        }
    }
}

/// Token to user mapping for standalone deployments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub tokens: HashMap<String, i64>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,reading_relay=debug".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9093)),
        }
    }
}

impl RelayConfig {
    /// Load from the default file location and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "relay".to_string());
        Self::load_from(&path)
    }

    /// Load with an explicit file stem or path
    pub fn load_from(path: &str) -> Result<Self> {
        debug!("Loading configuration from {}", path);

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RelayConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(RelayError::ConfigError(format!(
                "upstream.base_url must be an http(s) URL: {}",
                self.upstream.base_url
            )));
        }
        if self.upstream.base_url.ends_with('/') {
            return Err(RelayError::ConfigError(
                "upstream.base_url must not end with '/'".to_string(),
            ));
        }
        if self.upstream.deadline_ms == 0 {
            return Err(RelayError::ConfigError(
                "upstream.deadline_ms must be positive".to_string(),
            ));
        }
        if self.server.service.is_empty() || self.server.service.contains('/') {
            return Err(RelayError::ConfigError(format!(
                "server.service must be a single path segment: {:?}",
                self.server.service
            )));
        }
        if self.capture.queue_capacity == 0 || self.capture.batch_size == 0 {
            return Err(RelayError::ConfigError(
                "capture.queue_capacity and capture.batch_size must be positive".to_string(),
            ));
        }
        if self.emulation.default_page_size == 0 {
            return Err(RelayError::ConfigError(
                "emulation.default_page_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
