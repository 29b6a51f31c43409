// src/lib.rs
//! Reading Relay Engine Library
//!
//! A transparent relay between an e-reader and the vendor's reading-services
//! API. Every request is forwarded verbatim and the upstream response is
//! returned verbatim; alongside, each exchange is captured in redacted form,
//! and read-only annotation requests may be answered from a local store.
//!
//! # Architecture
//!
//! - **relay**: route parsing, upstream forwarding, per-request state machine, HTTP front-end
//! - **emulation**: forward-or-synthesize gate, response synthesis, annotation store seam
//! - **capture**: exchange snapshots, redaction, non-blocking recorder and sinks
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and error types

pub mod capture;
pub mod emulation;
pub mod observability;
pub mod relay;
pub mod utils;

// Re-export commonly used types
pub use capture::{CaptureRecorder, CaptureSink, Redactor};
pub use emulation::{AnnotationStore, EmulationGate, ResponseSynthesizer};
pub use relay::{RelayOrchestrator, RelayServer, RequestForwarder};
pub use utils::config::RelayConfig;
pub use utils::errors::{RelayError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
