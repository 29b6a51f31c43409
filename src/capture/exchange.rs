// src/capture/exchange.rs
//! Captured request/response snapshots
//!
//! An `ExchangeRecord` is one half of an exchange (request or response).
//! An `Exchange` pairs both halves under a shared id so they are queued,
//! written and read back as one unit.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::header::CONTENT_TYPE;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use ulid::Ulid;

/// Request method as recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    #[serde(untagged)]
    Other(String),
}

impl From<&Method> for HttpMethod {
    fn from(method: &Method) -> Self {
        match *method {
            Method::GET => HttpMethod::Get,
            Method::POST => HttpMethod::Post,
            Method::PUT => HttpMethod::Put,
            Method::PATCH => HttpMethod::Patch,
            Method::DELETE => HttpMethod::Delete,
            ref other => HttpMethod::Other(other.as_str().to_string()),
        }
    }
}

/// Ordered header list with case-insensitive names.
///
/// Names are stored lowercased; repeated names stay as separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a header; the name is lowercased
    pub fn push(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// Snapshot a hyper header map; non-UTF-8 values are stored lossily
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut list = Self::new();
        for (name, value) in headers {
            list.push(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        }
        list
    }

    /// All values for `name`, compared case-insensitively
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value for `name`
    pub fn get<'a>(&'a self, name: &str) -> Option<&'a str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Entries in arrival order
    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<(String, String)> {
        &mut self.0
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut list = Self::new();
        for (k, v) in iter {
            list.push(k, v);
        }
        list
    }
}

/// Body bytes plus whichever view fits.
///
/// Exactly one of `json`, `text` or `raw_base64` is set for a non-empty
/// body, so a sink always receives the content in some form.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedBody {
    #[serde(skip)]
    pub raw: Bytes,

    /// Length of `raw`
    pub size: usize,

    /// UTF-8 text when the body is text but not JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Parsed view for JSON content types whose bytes parse
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,

    /// Standard base64 of `raw` when neither view applies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_base64: Option<String>,
}

impl CapturedBody {
    pub fn new(raw: Bytes, content_type: Option<&str>) -> Self {
        let is_json = content_type
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false);

        let json = if is_json && !raw.is_empty() {
            serde_json::from_slice(&raw).ok()
        } else {
            None
        };
        let text = if json.is_none() {
            std::str::from_utf8(&raw).ok().filter(|s| !s.is_empty()).map(str::to_string)
        } else {
            None
        };
        let raw_base64 = (json.is_none() && text.is_none() && !raw.is_empty())
            .then(|| STANDARD.encode(&raw));

        Self {
            size: raw.len(),
            raw,
            text,
            json,
            raw_base64,
        }
    }

    pub fn empty() -> Self {
        Self::new(Bytes::new(), None)
    }
}

/// Which side of the exchange a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

/// Where the response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Forwarded,
    Synthesized,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Forwarded => "forwarded",
            Origin::Synthesized => "synthesized",
        }
    }
}

/// One captured half of an exchange
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRecord {
    pub exchange_id: Ulid,
    pub direction: Direction,
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderList,
    pub body: CapturedBody,
    pub timestamp: DateTime<Utc>,

    /// Response only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// Response only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExchangeRecord {
    /// Snapshot an inbound request
    pub fn request(
        exchange_id: Ulid,
        method: &Method,
        path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Self {
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        Self {
            exchange_id,
            direction: Direction::Request,
            method: HttpMethod::from(method),
            path: path.to_string(),
            query: parse_query(raw_query),
            body: CapturedBody::new(body, content_type),
            headers: HeaderList::from_header_map(headers),
            timestamp: Utc::now(),
            status: None,
            reason: None,
        }
    }

    /// Snapshot a response paired with `request`
    pub fn response(
        request: &ExchangeRecord,
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Self {
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        Self {
            exchange_id: request.exchange_id,
            direction: Direction::Response,
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            body: CapturedBody::new(body, content_type),
            headers: HeaderList::from_header_map(headers),
            timestamp: Utc::now(),
            status: Some(status.as_u16()),
            reason: status.canonical_reason().map(str::to_string),
        }
    }
}

/// A paired request and response, captured as one unit
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub id: Ulid,
    pub origin: Origin,
    pub request: ExchangeRecord,
    pub response: ExchangeRecord,
}

impl Exchange {
    pub fn new(origin: Origin, request: ExchangeRecord, response: ExchangeRecord) -> Self {
        Self {
            id: request.exchange_id,
            origin,
            request,
            response,
        }
    }
}

/// Split a raw query string into ordered pairs; no percent-decoding
pub fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    raw.unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
