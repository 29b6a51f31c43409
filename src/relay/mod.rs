// src/relay/mod.rs
//! Request relay
//!
//! - **Endpoint**: route parsing and the closed set of endpoint identities
//! - **Identity**: token → user resolution seam
//! - **Forwarder**: byte-faithful upstream calls with a deadline
//! - **Orchestrator**: per-request state machine
//! - **Server**: hyper front-end
//!
//! ```text
//! Device → Server → Orchestrator ─┬→ Gate → Synthesizer ─┐
//!                                 └→ Forwarder → Upstream ┴→ Recorder → Device
//! ```

pub mod endpoint;
pub mod forwarder;
pub mod identity;
pub mod orchestrator;
pub mod server;

pub use endpoint::{Endpoint, RoutePath};
pub use forwarder::{RequestForwarder, UpstreamResponse};
pub use identity::{IdentityResolver, StaticTokenResolver};
pub use orchestrator::{InboundRequest, OrchestratorParts, RelayOrchestrator, RelayResponse, RelayState};
pub use server::RelayServer;
