// src/emulation/mod.rs
//! Local emulation of read-only endpoints
//!
//! - **Gate**: decides forward vs synthesize
//! - **Synthesizer**: builds wire responses from local records
//! - **Store**: the external annotation store seam
//! - **Wire**: the upstream annotation schema

pub mod gate;
pub mod store;
pub mod synthesizer;
pub mod wire;

pub use gate::{EmulationDecision, EmulationGate, EmulationReason, Evaluation};
pub use store::{
    AnnotationStore, LocalAnnotationRecord, MemoryAnnotationStore, SqliteAnnotationStore, UserId,
};
pub use synthesizer::{PageRequest, ResponseSynthesizer, SynthesizedResponse};
pub use wire::{AnnotationKind, AnnotationPage, AnnotationPatch, WireAnnotation};
