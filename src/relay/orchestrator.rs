// src/relay/orchestrator.rs
//! Per-request relay state machine
//!
//! ```text
//! Received → Deciding ─┬→ Synthesizing ─┬→ Capturing → Completed
//!                      │                 └ (synthesis error)
//!                      └────────────────→ Forwarding ─┬→ Capturing → Completed
//!                                                      └→ Failed (502/504)
//! ```
//!
//! Capture never moves the machine to `Failed`. A failed or cancelled
//! forward records nothing.

use crate::capture::exchange::{Exchange, ExchangeRecord, Origin};
use crate::capture::recorder::{CaptureRecorder, RecorderConfig};
use crate::capture::redactor::{RedactionPolicy, Redactor};
use crate::capture::sink::CaptureSink;
use crate::utils::config::RelayConfig;
use crate::utils::errors::Result;
use crate::emulation::gate::{EmulationDecision, EmulationGate, EmulationReason, Evaluation};
use crate::emulation::store::{AnnotationStore, UserId};
use crate::emulation::synthesizer::{PageRequest, ResponseSynthesizer};
use crate::emulation::wire::AnnotationPatch;
use crate::relay::endpoint::{Endpoint, RoutePath};
use crate::relay::forwarder::RequestForwarder;
use crate::relay::identity::IdentityResolver;
use crate::utils::errors::ForwardError;
use bytes::Bytes;
use chrono::Utc;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use ulid::Ulid;

/// Per-request lifecycle; see the module diagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Received,
    Deciding,
    Synthesizing,
    Forwarding,
    Capturing,
    Completed,
    Failed,
}

/// Inbound request with its body fully read
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What goes back to the device
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Terminal state: `Completed` or `Failed`
    pub state: RelayState,
    /// `None` for relay-generated failures
    pub origin: Option<Origin>,
    pub decision: EmulationDecision,
}

impl RelayResponse {
    fn gateway_error(error: &ForwardError, decision: EmulationDecision) -> Self {
        let (status, message) = match error {
            ForwardError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "Gateway timeout"),
            ForwardError::Unreachable(_) => (StatusCode::BAD_GATEWAY, "Bad gateway"),
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Self {
            status,
            headers,
            body: Bytes::from(serde_json::json!({ "error": message }).to_string()),
            state: RelayState::Failed,
            origin: None,
            decision,
        }
    }
}

/// Collaborators and policy for one relay instance.
///
/// Shared by every connection; holds no per-request state and no lock of
/// its own.
pub struct RelayOrchestrator {
    service: String,
    deadline: Duration,
    default_page_size: usize,
    gate: EmulationGate,
    synthesizer: ResponseSynthesizer,
    forwarder: RequestForwarder,
    recorder: Arc<CaptureRecorder>,
    store: Arc<dyn AnnotationStore>,
    identity: Arc<dyn IdentityResolver>,
}

/// Construction parameters for [`RelayOrchestrator::new`]
pub struct OrchestratorParts {
    /// First path segment the relay answers to
    pub service: String,

    /// Overall budget for one upstream exchange
    pub deadline: Duration,

    /// Page size when the device sends no `limit`
    pub default_page_size: usize,

    pub gate: EmulationGate,

    pub forwarder: RequestForwarder,

    /// Must already be started
    pub recorder: Arc<CaptureRecorder>,

    /// Read for emulation; receives upstream-accepted mutations
    pub store: Arc<dyn AnnotationStore>,

    pub identity: Arc<dyn IdentityResolver>,
}

impl RelayOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            service: parts.service,
            deadline: parts.deadline,
            default_page_size: parts.default_page_size,
            gate: parts.gate,
            synthesizer: ResponseSynthesizer::new(),
            forwarder: parts.forwarder,
            recorder: parts.recorder,
            store: parts.store,
            identity: parts.identity,
        }
    }

    /// Wire the relay from configuration and injected collaborators.
    /// Starts the capture writer, so it must run inside a tokio runtime.
    pub fn from_config(
        config: &RelayConfig,
        store: Arc<dyn AnnotationStore>,
        identity: Arc<dyn IdentityResolver>,
        sink: Arc<dyn CaptureSink>,
    ) -> Result<Self> {
        let redactor = Redactor::new(RedactionPolicy::with_extra(
            &config.capture.extra_redacted_headers,
        ));
        let recorder = Arc::new(CaptureRecorder::new(
            RecorderConfig::from(&config.capture),
            redactor,
            sink,
        ));
        recorder.start();

        Ok(Self::new(OrchestratorParts {
            service: config.server.service.clone(),
            deadline: config.upstream.deadline(),
            default_page_size: config.emulation.default_page_size,
            gate: EmulationGate::new(&config.emulation),
            forwarder: RequestForwarder::new(&config.upstream)?,
            recorder,
            store,
            identity,
        }))
    }

    /// First path segment the relay answers to
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Recorder behind this relay, for flushing and shutdown
    pub fn recorder(&self) -> &Arc<CaptureRecorder> {
        &self.recorder
    }

    /// Relay one request. `None` means it was cancelled before completing.
    pub async fn handle(
        &self,
        route: &RoutePath,
        request: InboundRequest,
        cancel: &CancellationToken,
    ) -> Option<RelayResponse> {
        let mut state = RelayState::Received;
        let request_record = ExchangeRecord::request(
            Ulid::new(),
            &request.method,
            &request.path,
            request.query.as_deref(),
            &request.headers,
            request.body.clone(),
        );

        transition(&mut state, RelayState::Deciding);
        let endpoint = Endpoint::classify(&request.method, &route.endpoint_path);
        let user = self.identity.resolve(&route.token);
        let evaluation = self.evaluate(&endpoint, user).await;
        debug!(
            "{} {} -> {} (emulate={}, reason={})",
            request.method,
            endpoint.name(),
            if evaluation.decision.emulate { "synthesize" } else { "forward" },
            evaluation.decision.emulate,
            evaluation.decision.reason
        );

        let mut decision = evaluation.decision;
        if decision.emulate {
            transition(&mut state, RelayState::Synthesizing);
            let page = PageRequest::from_query(&request_record.query, self.default_page_size);
            match self.synthesizer.synthesize(&endpoint, &evaluation.records, page) {
                Ok(synthesized) => {
                    let mut headers = HeaderMap::new();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(synthesized.content_type));

                    transition(&mut state, RelayState::Capturing);
                    let response_record = ExchangeRecord::response(
                        &request_record,
                        synthesized.status,
                        &headers,
                        synthesized.body.clone(),
                    );
                    self.recorder
                        .record(Exchange::new(Origin::Synthesized, request_record, response_record));

                    transition(&mut state, RelayState::Completed);
                    metrics::counter!("relay_requests_total", "outcome" => "synthesized").increment(1);
                    return Some(RelayResponse {
                        status: synthesized.status,
                        headers,
                        body: synthesized.body,
                        state,
                        origin: Some(Origin::Synthesized),
                        decision,
                    });
                }
                Err(e) => {
                    warn!("Synthesis failed, forwarding instead: {}", e);
                    decision = EmulationDecision::forward(EmulationReason::NoLocalRecord);
                }
            }
        }

        transition(&mut state, RelayState::Forwarding);
        let forwarded = tokio::select! {
            result = self.forwarder.forward(
                &request.method,
                &route.endpoint_path,
                request.query.as_deref(),
                &request.headers,
                request.body.clone(),
                self.deadline,
            ) => result,
            _ = cancel.cancelled() => {
                debug!("Request cancelled while forwarding; nothing captured");
                return None;
            }
        };

        let upstream = match forwarded {
            Ok(upstream) => upstream,
            Err(e) => {
                transition(&mut state, RelayState::Failed);
                warn!("Forwarding {} failed: {}", endpoint.name(), e);
                metrics::counter!("relay_requests_total", "outcome" => "failed").increment(1);
                return Some(RelayResponse::gateway_error(&e, decision));
            }
        };

        if let (Endpoint::PatchAnnotations { book_id }, Some(user)) = (&endpoint, user) {
            if upstream.status.is_success() {
                self.hand_off_mutation(user, book_id, &request.body);
            }
        }

        transition(&mut state, RelayState::Capturing);
        let response_record = ExchangeRecord::response(
            &request_record,
            upstream.status,
            &upstream.headers,
            upstream.body.clone(),
        );
        self.recorder
            .record(Exchange::new(Origin::Forwarded, request_record, response_record));

        transition(&mut state, RelayState::Completed);
        metrics::counter!("relay_requests_total", "outcome" => "forwarded").increment(1);
        Some(RelayResponse {
            status: upstream.status,
            headers: upstream.headers,
            body: upstream.body,
            state,
            origin: Some(Origin::Forwarded),
            decision,
        })
    }

    async fn evaluate(&self, endpoint: &Endpoint, user: Option<UserId>) -> Evaluation {
        // ineligible endpoints never touch the store
        if !endpoint.is_emulation_eligible() {
            return Evaluation {
                decision: EmulationDecision::forward(EmulationReason::EndpointUnsupported),
                records: Vec::new(),
            };
        }

        let gate = self.gate.clone();
        let store = Arc::clone(&self.store);
        let endpoint = endpoint.clone();
        tokio::task::spawn_blocking(move || gate.evaluate(&endpoint, user, store.as_ref(), Utc::now()))
            .await
            .unwrap_or_else(|e| {
                warn!("Emulation lookup panicked: {}", e);
                Evaluation {
                    decision: EmulationDecision::forward(EmulationReason::NoLocalRecord),
                    records: Vec::new(),
                }
            })
    }

    /// Give an upstream-accepted PATCH to the store; it owns durability
    fn hand_off_mutation(&self, user: UserId, book_id: &str, body: &Bytes) {
        let Some(patch) = AnnotationPatch::from_slice(body) else {
            debug!("PATCH body for book {} is not a JSON object; not mirrored locally", book_id);
            return;
        };
        if patch.is_empty() {
            return;
        }

        let store = Arc::clone(&self.store);
        let book_id = book_id.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.apply_upstream_mutation(user, &book_id, &patch) {
                warn!("Store rejected upstream mutation for book {}: {}", book_id, e);
            }
        });
    }
}

fn transition(state: &mut RelayState, next: RelayState) {
    trace!("relay state {:?} -> {:?}", state, next);
    *state = next;
}
