// src/capture/mod.rs
//! Exchange capture
//!
//! - **Exchange**: request/response snapshots
//! - **Redactor**: credential masking
//! - **Queue**: bounded lock-free hand-off
//! - **Recorder**: background writer feeding a sink
//! - **Sink**: tracing, SQLite and in-memory destinations
//!
//! ```text
//! Orchestrator → record() → Redactor → Queue ─(writer task)→ Sink
//!                 (never blocks)                (spawn_blocking)
//! ```

pub mod exchange;
pub mod queue;
pub mod recorder;
pub mod redactor;
pub mod sink;

pub use exchange::{Direction, Exchange, ExchangeRecord, HeaderList, HttpMethod, Origin};
pub use recorder::{CaptureRecorder, RecorderConfig, RecorderStats};
pub use redactor::{RedactionPolicy, Redactor, MASK};
pub use sink::{CaptureSink, MemorySink, SqliteSink, TracingSink};
