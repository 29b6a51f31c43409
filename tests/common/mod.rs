// tests/common/mod.rs
//! Shared fixtures: a scriptable mock upstream and a relay wired to it

#![allow(dead_code)]

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use reading_relay::capture::{CaptureSink, MemorySink};
use reading_relay::emulation::{AnnotationKind, LocalAnnotationRecord, MemoryAnnotationStore, UserId};
use reading_relay::relay::{InboundRequest, RelayOrchestrator, RoutePath, StaticTokenResolver};
use reading_relay::utils::config::RelayConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const SERVICE: &str = "readingservices";
pub const TOKEN: &str = "device-token-123";
pub const USER: UserId = UserId(1);

/// Request as seen by the upstream
#[derive(Debug, Clone)]
pub struct Received {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(&'static str, &'static str)>,
    pub body: Bytes,
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn json(status: u16, body: &'static str) -> Self {
        Self {
            status,
            headers: vec![("content-type", "application/json")],
            body: Bytes::from_static(body.as_bytes()),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Responder = Arc<dyn Fn(&Received) -> Reply + Send + Sync>;

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<Received>>>,
    shutdown: CancellationToken,
}

impl MockUpstream {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Received) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();
        let responder: Responder = Arc::new(responder);

        let log = Arc::clone(&received);
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    accepted = listener.accept() => accepted.unwrap(),
                    _ = stop.cancelled() => return,
                };
                let log = Arc::clone(&log);
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let log = Arc::clone(&log);
                        let responder = Arc::clone(&responder);
                        async move {
                            let (parts, body) = req.into_parts();
                            let received = Received {
                                method: parts.method,
                                path_and_query: parts
                                    .uri
                                    .path_and_query()
                                    .map(|pq| pq.as_str().to_string())
                                    .unwrap_or_default(),
                                headers: parts.headers,
                                body: body.collect().await.unwrap().to_bytes(),
                            };
                            let reply = responder(&received);
                            log.lock().push(received);

                            if let Some(delay) = reply.delay {
                                tokio::time::sleep(delay).await;
                            }
                            let mut response = Response::new(Full::new(reply.body));
                            *response.status_mut() = StatusCode::from_u16(reply.status).unwrap();
                            for (name, value) in reply.headers {
                                response.headers_mut().insert(name, value.parse().unwrap());
                            }
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            received,
            shutdown,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Received> {
        self.received.lock().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn config_for(base_url: &str) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.upstream.base_url = base_url.to_string();
    config.upstream.deadline_ms = 2_000;
    config.server.service = SERVICE.to_string();
    config
}

pub struct Harness {
    pub orchestrator: Arc<RelayOrchestrator>,
    pub store: Arc<MemoryAnnotationStore>,
    pub sink: MemorySink,
}

impl Harness {
    pub fn new(config: &RelayConfig) -> Self {
        let sink = MemorySink::new();
        Self::build(config, sink.clone(), Arc::new(sink))
    }

    /// Relay whose capture goes to `capture` instead of the memory sink
    pub fn with_capture(config: &RelayConfig, capture: Arc<dyn CaptureSink>) -> Self {
        Self::build(config, MemorySink::new(), capture)
    }

    fn build(config: &RelayConfig, sink: MemorySink, capture: Arc<dyn CaptureSink>) -> Self {
        let store = Arc::new(MemoryAnnotationStore::new());
        let identity = Arc::new(StaticTokenResolver::default().with_token(TOKEN, USER));
        let orchestrator = Arc::new(
            RelayOrchestrator::from_config(config, store.clone(), identity, capture).unwrap(),
        );
        Self {
            orchestrator,
            store,
            sink,
        }
    }

    pub async fn flush_capture(&self) {
        self.orchestrator.recorder().flush().await;
    }
}

pub fn relay_path(endpoint_path: &str) -> String {
    format!("/{}/{}{}", SERVICE, TOKEN, endpoint_path)
}

pub fn inbound(method: Method, endpoint_path: &str, query: Option<&str>, body: &[u8]) -> (RoutePath, InboundRequest) {
    let path = relay_path(endpoint_path);
    let route = RoutePath::parse(&path, SERVICE).unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer device-secret".parse().unwrap());
    headers.insert("x-kobo-userkey", "user-key-secret".parse().unwrap());
    headers.insert("content-type", "application/json".parse().unwrap());
    headers.insert("host", "relay.local".parse().unwrap());

    let request = InboundRequest {
        method,
        path,
        query: query.map(str::to_string),
        headers,
        body: Bytes::copy_from_slice(body),
    };
    (route, request)
}

pub fn highlight(id: &str, book: &str) -> LocalAnnotationRecord {
    LocalAnnotationRecord {
        id: id.to_string(),
        user_id: USER,
        book_id: book.to_string(),
        kind: Some(AnnotationKind::Highlight),
        highlighted_text: Some("Hi".to_string()),
        note_text: None,
        highlight_color: Some("yellow".to_string()),
        chapter_filename: Some("c1.xhtml".to_string()),
        chapter_progress: Some(0.5),
        last_modified: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
        raw: None,
    }
}
