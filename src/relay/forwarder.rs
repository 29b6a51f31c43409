// src/relay/forwarder.rs
//! Byte-faithful upstream forwarding
//!
//! Method, path, raw query, headers and body are replayed against the
//! upstream base URL. Only hop-by-hop headers and the relay's own session
//! cookie are dropped on the way out; only framing headers are dropped on
//! the way back. Redirects are returned to the device, not followed.

use crate::utils::config::UpstreamConfig;
use crate::utils::errors::{ForwardError, RelayError, Result};
use bytes::Bytes;
use hyper::header::HeaderName;
use hyper::{HeaderMap, Method, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Request headers that describe the inbound hop, not the exchange
const REQUEST_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    // relay session cookie; the upstream has no use for it
    "cookie",
];

/// Response headers recomputed by the outbound hop
const RESPONSE_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

/// What the upstream answered
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Upstream client with redirects disabled
pub struct RequestForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl RequestForwarder {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| RelayError::ConfigError(format!("Failed to build upstream client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    /// Upstream URL for an endpoint path and raw query
    pub fn upstream_url(&self, endpoint_path: &str, raw_query: Option<&str>) -> String {
        match raw_query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url, endpoint_path, q),
            _ => format!("{}{}", self.base_url, endpoint_path),
        }
    }

    /// Replay one request upstream within `deadline`.
    ///
    /// Any status the upstream answers with is `Ok`; only transport failures
    /// and the deadline produce `ForwardError`.
    pub async fn forward(
        &self,
        method: &Method,
        endpoint_path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
        deadline: Duration,
    ) -> std::result::Result<UpstreamResponse, ForwardError> {
        let url = self.upstream_url(endpoint_path, raw_query);
        debug!("Forwarding {} {}", method, url);

        let request = self
            .client
            .request(method.clone(), &url)
            .headers(strip(headers, REQUEST_HOP_HEADERS))
            .body(body);

        let started = Instant::now();
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        let result = tokio::time::timeout(deadline, exchange).await;
        metrics::histogram!("relay_forward_duration_seconds").record(started.elapsed().as_secs_f64());

        let (status, headers, body) = match result {
            Err(_) => return Err(ForwardError::Timeout { deadline }),
            Ok(Err(e)) if e.is_timeout() => return Err(ForwardError::Timeout { deadline }),
            Ok(Err(e)) => return Err(ForwardError::Unreachable(e.to_string())),
            Ok(Ok(parts)) => parts,
        };

        if status.as_u16() >= 400 {
            warn!("Upstream error {} for {} {}", status, method, endpoint_path);
        }

        Ok(UpstreamResponse {
            status,
            headers: strip(&headers, RESPONSE_HOP_HEADERS),
            body,
        })
    }
}

/// Copy of `headers` without `drop`, plus anything `Connection` nominates
fn strip(headers: &HeaderMap, drop: &[&str]) -> HeaderMap {
    let nominated: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if drop.contains(&lower) || nominated.iter().any(|n| n == lower) {
            continue;
        }
        out.append(HeaderName::clone(name), value.clone());
    }
    out
}
