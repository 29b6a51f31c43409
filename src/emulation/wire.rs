// src/emulation/wire.rs
//! Annotation wire schema of the reading-services API
//!
//! Field names and the `YYYY-MM-DDTHH:MM:SSZ` date format are dictated by
//! the upstream service.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Highlight or note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Highlight,
    Note,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Highlight => "highlight",
            AnnotationKind::Note => "note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "highlight" => Some(AnnotationKind::Highlight),
            "note" => Some(AnnotationKind::Note),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSpan {
    pub chapter_filename: String,
    pub chapter_progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireLocation {
    pub span: WireSpan,
}

/// One annotation as the device sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAnnotation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    pub highlighted_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_text: Option<String>,
    pub highlight_color: String,
    pub location: WireLocation,
    pub client_last_modified_utc: String,
}

/// Body of GET `/content/{book}/annotations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationPage<A = WireAnnotation> {
    pub annotations: Vec<A>,
    pub next_page_offset_token: Option<String>,
}

/// Body of PATCH `/content/{book}/annotations`.
///
/// Parsed leniently: each updated annotation stays raw JSON so one
/// malformed entry cannot hide the rest of the mutation, and non-string
/// deletion ids are skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationPatch {
    pub updated_annotations: Vec<Value>,
    pub deleted_annotation_ids: Vec<String>,
}

impl AnnotationPatch {
    /// `None` unless the body is a JSON object
    pub fn from_slice(body: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let object = value.as_object()?;

        let array = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };

        Some(Self {
            updated_annotations: array("updatedAnnotations")
                .into_iter()
                .filter(Value::is_object)
                .collect(),
            deleted_annotation_ids: array("deletedAnnotationIds")
                .into_iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.updated_annotations.is_empty() && self.deleted_annotation_ids.is_empty()
    }
}

/// `2024-01-15T10:30:00Z`
pub fn format_wire_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Accepts the wire format and any RFC 3339 offset; devices are not always strict
pub fn parse_wire_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
