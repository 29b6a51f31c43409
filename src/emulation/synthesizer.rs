// src/emulation/synthesizer.rs
//! Builds upstream-shaped responses from local records
//!
//! Output must be structurally indistinguishable from the real service's
//! response for the same endpoint. Identifiers the upstream mints per
//! request (trace ids and the like) are omitted, never invented.

use crate::emulation::store::LocalAnnotationRecord;
use crate::emulation::wire::{
    format_wire_timestamp, AnnotationPage, WireAnnotation, WireLocation, WireSpan,
};
use crate::relay::endpoint::Endpoint;
use crate::utils::errors::SynthesisError;
use bytes::Bytes;
use hyper::StatusCode;
use serde_json::Value;
use tracing::debug;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// `limit`/`offset` paging as sent by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl PageRequest {
    /// Missing or non-numeric values fall back to the defaults
    pub fn from_query(query: &[(String, String)], default_limit: usize) -> Self {
        let lookup = |key: &str| {
            query
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| v.parse::<usize>().ok())
        };
        Self {
            limit: lookup("limit").filter(|l| *l > 0).unwrap_or(default_limit),
            offset: lookup("offset").unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesizedResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseSynthesizer;

impl ResponseSynthesizer {
    pub fn new() -> Self {
        Self
    }

    pub fn synthesize(
        &self,
        endpoint: &Endpoint,
        records: &[LocalAnnotationRecord],
        page: PageRequest,
    ) -> Result<SynthesizedResponse, SynthesisError> {
        match endpoint {
            Endpoint::GetAnnotations { book_id } => {
                debug!("Synthesizing annotations for book {}", book_id);
                self.annotation_page(records, page)
            }
            Endpoint::PatchAnnotations { .. }
            | Endpoint::CheckForChanges
            | Endpoint::UserStorage { .. }
            | Endpoint::Other => Err(SynthesisError::Unsupported(endpoint.name())),
        }
    }

    fn annotation_page(
        &self,
        records: &[LocalAnnotationRecord],
        page: PageRequest,
    ) -> Result<SynthesizedResponse, SynthesisError> {
        // every record must be complete, not just the requested page
        let mut annotations = records
            .iter()
            .map(|r| annotation_json(r).map(|json| (r, json)))
            .collect::<Result<Vec<_>, _>>()?;

        annotations.sort_by(|(a, _), (b, _)| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = annotations.len();
        let next_offset = page.offset.saturating_add(page.limit);
        let body = AnnotationPage::<Value> {
            annotations: annotations
                .into_iter()
                .skip(page.offset)
                .take(page.limit)
                .map(|(_, json)| json)
                .collect(),
            next_page_offset_token: (next_offset < total).then(|| next_offset.to_string()),
        };

        let bytes = serde_json::to_vec(&body)
            .map_err(|e| SynthesisError::Serialization(e.to_string()))?;

        Ok(SynthesizedResponse {
            status: StatusCode::OK,
            content_type: JSON_CONTENT_TYPE,
            body: Bytes::from(bytes),
        })
    }
}

/// Wire object for one record: the stored device JSON with the validated
/// schema fields laid over it, so fields the relay does not model survive.
fn annotation_json(record: &LocalAnnotationRecord) -> Result<Value, SynthesisError> {
    let wire = serde_json::to_value(to_wire(record)?)
        .map_err(|e| SynthesisError::Serialization(e.to_string()))?;

    match record.raw.clone() {
        Some(mut raw @ Value::Object(_)) => {
            overlay(&mut raw, wire);
            Ok(raw)
        }
        _ => Ok(wire),
    }
}

/// Deep-merge `top` into `base`; objects merge key by key, anything else replaces
fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base), Value::Object(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, top) => *base = top,
    }
}

fn require<T: Clone>(
    record: &LocalAnnotationRecord,
    value: &Option<T>,
    field: &'static str,
) -> Result<T, SynthesisError> {
    value.clone().ok_or_else(|| SynthesisError::MissingField {
        record_id: record.id.clone(),
        field,
    })
}

/// Map a local record onto the wire schema
pub fn to_wire(record: &LocalAnnotationRecord) -> Result<WireAnnotation, SynthesisError> {
    if record.id.is_empty() {
        return Err(SynthesisError::MissingField {
            record_id: String::new(),
            field: "id",
        });
    }

    let chapter_progress = require(record, &record.chapter_progress, "chapterProgress")?;
    if !(0.0..=1.0).contains(&chapter_progress) {
        return Err(SynthesisError::OutOfRange {
            record_id: record.id.clone(),
            field: "chapterProgress",
        });
    }

    Ok(WireAnnotation {
        id: record.id.clone(),
        kind: require(record, &record.kind, "type")?,
        highlighted_text: require(record, &record.highlighted_text, "highlightedText")?,
        note_text: record.note_text.clone(),
        highlight_color: require(record, &record.highlight_color, "highlightColor")?,
        location: WireLocation {
            span: WireSpan {
                chapter_filename: require(record, &record.chapter_filename, "chapterFilename")?,
                chapter_progress,
            },
        },
        client_last_modified_utc: format_wire_timestamp(&record.last_modified),
    })
}
