// src/utils/errors.rs
//! Error types for the relay engine
//!
//! Each layer has its own error enum so the orchestrator can decide how a
//! failure affects the client-visible outcome:
//!
//! - `ForwardError` surfaces to the client as 504/502
//! - `SynthesisError` demotes an emulated request to forwarding
//! - `CaptureError` and `StoreError` are logged and swallowed

use std::time::Duration;
use thiserror::Error;

/// Crate-level result alias
pub type Result<T> = std::result::Result<T, RelayError>;

/// Top-level relay error
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerFailed(String),

    #[error("Observability setup failed: {0}")]
    ObservabilityFailed(String),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures at the network boundary with the upstream service.
///
/// Never retried inside the relay; retry policy belongs to the device.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Upstream did not answer within {deadline:?}")]
    Timeout { deadline: Duration },

    #[error("Upstream unreachable: {0}")]
    Unreachable(String),
}

/// Local data cannot be turned into a wire response
#[derive(Debug, Error, PartialEq)]
pub enum SynthesisError {
    #[error("Annotation {record_id} is missing required field `{field}`")]
    MissingField {
        record_id: String,
        field: &'static str,
    },

    #[error("Annotation {record_id} has out-of-range `{field}`")]
    OutOfRange {
        record_id: String,
        field: &'static str,
    },

    #[error("Endpoint {0} cannot be synthesized")]
    Unsupported(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Capture sink failures. Best-effort: never reaches the client.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Capture queue full")]
    QueueFull,
}

/// Local annotation store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store query failed: {0}")]
    QueryFailed(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::QueryFailed(e.to_string())
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(e: config::ConfigError) -> Self {
        RelayError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_error_display() {
        let err = ForwardError::Timeout {
            deadline: Duration::from_secs(10),
        };
        assert!(err.to_string().contains("10s"));

        let err: RelayError = ForwardError::Unreachable("connection refused".into()).into();
        assert_eq!(err.to_string(), "Upstream unreachable: connection refused");
    }

    #[test]
    fn test_synthesis_error_names_field() {
        let err = SynthesisError::MissingField {
            record_id: "a1".into(),
            field: "highlightedText",
        };
        assert!(err.to_string().contains("highlightedText"));
        assert!(err.to_string().contains("a1"));
    }
}
