// src/relay/server.rs
//! HTTP front-end
//!
//! Accepts device connections, reads each request body fully and hands the
//! request to the orchestrator. Requests outside `/{service}/{token}/...`
//! get a 404 without touching the upstream.

use crate::relay::endpoint::RoutePath;
use crate::relay::orchestrator::{InboundRequest, RelayOrchestrator};
use crate::utils::errors::{RelayError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default grace period for in-flight requests at shutdown
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

pub struct RelayServer {
    orchestrator: Arc<RelayOrchestrator>,
    drain_timeout: Duration,
}

impl RelayServer {
    pub fn new(orchestrator: Arc<RelayOrchestrator>) -> Self {
        Self {
            orchestrator,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Grace period in-flight requests get after shutdown is signalled
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Bind `addr` and serve until `shutdown` is cancelled
    pub async fn bind_and_serve(self: Arc<Self>, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::ServerFailed(format!("Failed to bind {}: {}", addr, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve an already-bound listener until `shutdown` is cancelled.
    ///
    /// Shutdown stops accepting, lets in-flight requests finish within the
    /// drain timeout, then cancels whatever is still running.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            "Relay listening on {} (service /{}/)",
            local,
            self.orchestrator.service()
        );

        // cancels requests still running once the drain timeout passes
        let abort = CancellationToken::new();
        let mut connections = JoinSet::new();

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
                _ = shutdown.cancelled() => break,
            };

            let server = Arc::clone(&self);
            let graceful = shutdown.clone();
            let abort = abort.clone();
            connections.spawn(async move {
                debug!("Accepted connection from {}", addr);
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    let cancel = abort.child_token();
                    async move { Ok::<_, Infallible>(server.handle_request(req, cancel).await) }
                });

                let conn = http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);
                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = graceful.cancelled() => {
                        // finish the request in progress, then close
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = result {
                    debug!("Connection error from {}: {}", addr, e);
                }
            });
        }

        drop(listener);
        info!(
            "Relay listener on {} shutting down, draining {} connections",
            local,
            connections.len()
        );

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!(
                "Drain timeout of {:?} passed; cancelling {} connections",
                self.drain_timeout,
                connections.len()
            );
            abort.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            connections.shutdown().await;
        }

        info!("Relay listener on {} stopped", local);
        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        cancel: CancellationToken,
    ) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        let Some(route) = RoutePath::parse(&path, self.orchestrator.service()) else {
            debug!("No relay route for {}", path);
            return json_response(StatusCode::NOT_FOUND, "Not found");
        };

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("Failed to read request body: {}", e);
                return json_response(StatusCode::BAD_REQUEST, "Unreadable request body");
            }
        };

        let inbound = InboundRequest {
            method: parts.method,
            query: parts.uri.query().map(str::to_string),
            path,
            headers: parts.headers,
            body,
        };

        match self.orchestrator.handle(&route, inbound, &cancel).await {
            Some(relayed) => {
                let mut response = Response::new(Full::new(relayed.body));
                *response.status_mut() = relayed.status;
                *response.headers_mut() = relayed.headers;
                response
            }
            // cancelled after the drain timeout
            None => json_response(StatusCode::SERVICE_UNAVAILABLE, "Relay shutting down"),
        }
    }
}

fn json_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
