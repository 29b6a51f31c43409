// src/capture/redactor.rs
//! Masks credentials before anything reaches a capture sink
//!
//! The policy is a fixed set of header names (compared case-insensitively)
//! plus the per-user token embedded in the route path. Masking is total and
//! idempotent: applying it twice equals applying it once.

use crate::capture::exchange::{Exchange, ExchangeRecord, HeaderList};
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Replacement for every masked value
pub const MASK: &str = "[REDACTED]";

/// Headers that always carry credentials or identity
static DEFAULT_POLICY: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "authorization",
        "proxy-authorization",
        "cookie",
        "set-cookie",
        "x-kobo-userkey",
        "x-kobo-devicetoken",
        "x-kobo-synctoken",
    ]
});

/// Set of header names whose values are masked
#[derive(Debug, Clone)]
pub struct RedactionPolicy {
    names: HashSet<String>,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            names: DEFAULT_POLICY.iter().map(|n| n.to_string()).collect(),
        }
    }
}

impl RedactionPolicy {
    /// Built-in policy extended with `extra` names
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for name in extra {
            policy.names.insert(name.as_ref().to_ascii_lowercase());
        }
        policy
    }

    pub fn covers(&self, name: &str) -> bool {
        self.names.contains(&name.to_ascii_lowercase())
    }
}

/// Stateless masking functions over a policy
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    policy: RedactionPolicy,
}

impl Redactor {
    pub fn new(policy: RedactionPolicy) -> Self {
        Self { policy }
    }

    /// Policy this redactor applies
    pub fn policy(&self) -> &RedactionPolicy {
        &self.policy
    }

    /// Copy of `headers` with every policy entry masked; order kept
    pub fn redact(&self, headers: &HeaderList) -> HeaderList {
        let mut out = headers.clone();
        for (name, value) in out.entries_mut() {
            if self.policy.covers(name) {
                *value = MASK.to_string();
            }
        }
        out
    }

    /// Mask query values whose key is a policy name
    pub fn redact_query(&self, query: &[(String, String)]) -> Vec<(String, String)> {
        query
            .iter()
            .map(|(k, v)| {
                if self.policy.covers(k) {
                    (k.clone(), MASK.to_string())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    /// Mask the token segment of `/{service}/{token}/...`
    pub fn redact_path(&self, path: &str) -> String {
        let mut segments: Vec<&str> = path.split('/').collect();
        // ["", service, token, ...]
        if segments.len() > 2 && !segments[2].is_empty() {
            segments[2] = MASK;
        }
        segments.join("/")
    }

    /// Mask headers, query and path of one half; the body is left alone
    pub fn redact_record(&self, mut record: ExchangeRecord) -> ExchangeRecord {
        record.headers = self.redact(&record.headers);
        record.query = self.redact_query(&record.query);
        record.path = self.redact_path(&record.path);
        record
    }

    /// Mask both halves, keeping the pairing id
    pub fn redact_exchange(&self, exchange: Exchange) -> Exchange {
        Exchange {
            id: exchange.id,
            origin: exchange.origin,
            request: self.redact_record(exchange.request),
            response: self.redact_record(exchange.response),
        }
    }
}
