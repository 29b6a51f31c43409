// src/emulation/store.rs
//! Local annotation store
//!
//! The relay only reads this store to answer emulated requests, and hands
//! upstream-confirmed mutations back to it. Durability and write
//! serialization belong to the store implementation.

use crate::emulation::wire::{parse_wire_timestamp, AnnotationKind, AnnotationPatch};
use crate::utils::errors::StoreError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Already-validated local user identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Annotation row as kept locally.
///
/// Content fields are optional because a damaged row can lack them; the
/// synthesizer refuses such rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAnnotationRecord {
    pub id: String,
    pub user_id: UserId,
    pub book_id: String,
    pub kind: Option<AnnotationKind>,
    pub highlighted_text: Option<String>,
    pub note_text: Option<String>,
    pub highlight_color: Option<String>,
    pub chapter_filename: Option<String>,
    pub chapter_progress: Option<f64>,
    pub last_modified: DateTime<Utc>,

    /// Annotation object exactly as the device last sent it
    pub raw: Option<Value>,
}

impl LocalAnnotationRecord {
    /// Extract a record from one device-sent annotation object.
    ///
    /// Only a non-empty `id` is required; absent fields stay `None`. A
    /// missing `type` means highlight. Unparseable timestamps fall back to now.
    pub fn from_json(user_id: UserId, book_id: &str, annotation: &Value) -> Option<Self> {
        let id = annotation.get("id")?.as_str().filter(|id| !id.is_empty())?;
        let text = |pointer: &str| {
            annotation
                .pointer(pointer)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let kind = match annotation.get("type") {
            None | Some(Value::Null) => Some(AnnotationKind::Highlight),
            Some(kind) => kind.as_str().and_then(AnnotationKind::parse),
        };

        Some(Self {
            id: id.to_string(),
            user_id,
            book_id: book_id.to_string(),
            kind,
            highlighted_text: text("/highlightedText"),
            note_text: text("/noteText"),
            highlight_color: text("/highlightColor"),
            chapter_filename: text("/location/span/chapterFilename"),
            chapter_progress: annotation
                .pointer("/location/span/chapterProgress")
                .and_then(Value::as_f64),
            last_modified: text("/clientLastModifiedUtc")
                .as_deref()
                .and_then(parse_wire_timestamp)
                .unwrap_or_else(Utc::now),
            raw: Some(annotation.clone()),
        })
    }
}

/// Records extracted from a patch's updates; entries without an id are skipped
fn updated_records(user: UserId, book_id: &str, patch: &AnnotationPatch) -> Vec<LocalAnnotationRecord> {
    patch
        .updated_annotations
        .iter()
        .filter_map(|annotation| {
            let record = LocalAnnotationRecord::from_json(user, book_id, annotation);
            if record.is_none() {
                debug!("Skipping updated annotation without id for book {}", book_id);
            }
            record
        })
        .collect()
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// External annotation store.
///
/// Implementations may block; the relay calls them from blocking workers.
pub trait AnnotationStore: Send + Sync {
    /// All annotations of `user` for `book_id`, any order
    fn annotations_for(&self, user: UserId, book_id: &str) -> StoreResult<Vec<LocalAnnotationRecord>>;

    /// Apply a PATCH the upstream service has accepted.
    ///
    /// Deletions and each update apply independently of one another.
    fn apply_upstream_mutation(
        &self,
        user: UserId,
        book_id: &str,
        patch: &AnnotationPatch,
    ) -> StoreResult<()>;
}

/// In-process store keyed by (user, book)
#[derive(Debug, Default)]
pub struct MemoryAnnotationStore {
    records: DashMap<(UserId, String), Vec<LocalAnnotationRecord>>,
}

impl MemoryAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by annotation id
    pub fn upsert(&self, record: LocalAnnotationRecord) {
        let mut entry = self
            .records
            .entry((record.user_id, record.book_id.clone()))
            .or_default();
        entry.retain(|r| r.id != record.id);
        entry.push(record);
    }
}

impl AnnotationStore for MemoryAnnotationStore {
    fn annotations_for(&self, user: UserId, book_id: &str) -> StoreResult<Vec<LocalAnnotationRecord>> {
        Ok(self
            .records
            .get(&(user, book_id.to_string()))
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    fn apply_upstream_mutation(
        &self,
        user: UserId,
        book_id: &str,
        patch: &AnnotationPatch,
    ) -> StoreResult<()> {
        if !patch.deleted_annotation_ids.is_empty() {
            for mut entry in self.records.iter_mut().filter(|e| e.key().0 == user) {
                entry.retain(|r| !patch.deleted_annotation_ids.contains(&r.id));
            }
        }
        for record in updated_records(user, book_id, patch) {
            self.upsert(record);
        }
        Ok(())
    }
}

/// SQLite-backed store
pub struct SqliteAnnotationStore {
    db: Mutex<Connection>,
}

impl SqliteAnnotationStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::Unavailable(format!("Failed to open database: {}", e)))?;
        let store = Self::with_connection(conn)?;
        info!("Annotation store opened at {:?}", path.as_ref());
        Ok(store)
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS annotations (
                annotation_id TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                book_id TEXT NOT NULL,
                kind TEXT,
                highlighted_text TEXT,
                note_text TEXT,
                highlight_color TEXT,
                chapter_filename TEXT,
                chapter_progress REAL,
                last_modified TEXT NOT NULL,
                annotation_data TEXT,
                PRIMARY KEY (user_id, annotation_id)
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_annotations_book ON annotations(user_id, book_id)",
            [],
        )?;

        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Insert or replace by (user, annotation id)
    pub fn upsert(&self, record: &LocalAnnotationRecord) -> StoreResult<()> {
        let db = self.db.lock();
        Self::upsert_with(&db, record)
    }

    fn upsert_with(conn: &Connection, record: &LocalAnnotationRecord) -> StoreResult<()> {
        conn.execute(
            r#"
            INSERT INTO annotations (annotation_id, user_id, book_id, kind, highlighted_text,
                note_text, highlight_color, chapter_filename, chapter_progress, last_modified,
                annotation_data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(user_id, annotation_id) DO UPDATE SET
                book_id = excluded.book_id,
                kind = excluded.kind,
                highlighted_text = excluded.highlighted_text,
                note_text = excluded.note_text,
                highlight_color = excluded.highlight_color,
                chapter_filename = excluded.chapter_filename,
                chapter_progress = excluded.chapter_progress,
                last_modified = excluded.last_modified,
                annotation_data = excluded.annotation_data
            "#,
            params![
                record.id,
                record.user_id.0,
                record.book_id,
                record.kind.map(|k| k.as_str()),
                record.highlighted_text,
                record.note_text,
                record.highlight_color,
                record.chapter_filename,
                record.chapter_progress,
                record.last_modified.to_rfc3339(),
                record.raw,
            ],
        )?;
        Ok(())
    }
}

impl AnnotationStore for SqliteAnnotationStore {
    fn annotations_for(&self, user: UserId, book_id: &str) -> StoreResult<Vec<LocalAnnotationRecord>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            r#"
            SELECT annotation_id, user_id, book_id, kind, highlighted_text, note_text,
                   highlight_color, chapter_filename, chapter_progress, last_modified,
                   annotation_data
            FROM annotations WHERE user_id = ? AND book_id = ?
            "#,
        )?;

        let rows = stmt
            .query_map(params![user.0, book_id], |row| {
                let kind: Option<String> = row.get(3)?;
                let last_modified: String = row.get(9)?;
                Ok(LocalAnnotationRecord {
                    id: row.get(0)?,
                    user_id: UserId(row.get(1)?),
                    book_id: row.get(2)?,
                    kind: kind.as_deref().and_then(AnnotationKind::parse),
                    highlighted_text: row.get(4)?,
                    note_text: row.get(5)?,
                    highlight_color: row.get(6)?,
                    chapter_filename: row.get(7)?,
                    chapter_progress: row.get(8)?,
                    last_modified: parse_wire_timestamp(&last_modified)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                    raw: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!("Loaded {} annotations for user {} book {}", rows.len(), user, book_id);
        Ok(rows)
    }

    fn apply_upstream_mutation(
        &self,
        user: UserId,
        book_id: &str,
        patch: &AnnotationPatch,
    ) -> StoreResult<()> {
        let updated = updated_records(user, book_id, patch);
        let mut db = self.db.lock();
        let tx = db.transaction()?;

        for id in &patch.deleted_annotation_ids {
            tx.execute(
                "DELETE FROM annotations WHERE user_id = ? AND annotation_id = ?",
                params![user.0, id],
            )?;
        }
        for record in &updated {
            Self::upsert_with(&tx, record)?;
        }

        tx.commit()?;
        debug!(
            "Applied upstream mutation for user {} book {}: {} updated, {} deleted",
            user,
            book_id,
            updated.len(),
            patch.deleted_annotation_ids.len()
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
        use chrono::TimeZone;
    use tempfile::tempdir;

    pub(crate) fn record(id: &str, user: i64, book: &str) -> LocalAnnotationRecord {
        LocalAnnotationRecord {
            id: id.to_string(),
            user_id: UserId(user),
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

    fn wire(id: &str) -> Value {
        serde_json::json!({
            "id": id,
            "type": "note",
            "highlightedText": "text",
            "noteText": "note",
            "highlightColor": "blue",
            "location": {"span": {"chapterFilename": "c2.xhtml", "chapterProgress": 0.75}},
            "clientLastModifiedUtc": "2024-02-01T08:00:00Z"
        })
    }

    fn ids(mut records: Vec<LocalAnnotationRecord>) -> Vec<String> {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records.into_iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_memory_store_scopes_by_user_and_book() {
        let store = MemoryAnnotationStore::new();
        store.upsert(record("a1", 1, "b1"));
        store.upsert(record("a2", 2, "b1"));
        store.upsert(record("a3", 1, "b2"));

        let found = store.annotations_for(UserId(1), "b1").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a1");
        assert!(store.annotations_for(UserId(3), "b1").unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_applies_patch() {
        let store = MemoryAnnotationStore::new();
        store.upsert(record("a1", 1, "b1"));
        store.upsert(record("a2", 1, "b1"));

        let patch = AnnotationPatch {
            updated_annotations: vec![wire("a3")],
            deleted_annotation_ids: vec!["a1".to_string()],
        };
        store.apply_upstream_mutation(UserId(1), "b1", &patch).unwrap();

        assert_eq!(ids(store.annotations_for(UserId(1), "b1").unwrap()), vec!["a2", "a3"]);
    }

    #[test]
    fn test_sqlite_store_round_trips_optional_fields() {
        let dir = tempdir().unwrap();
        let store = SqliteAnnotationStore::open(dir.path().join("annotations.db")).unwrap();

        let mut damaged = record("a2", 1, "b1");
        damaged.highlighted_text = None;
        store.upsert(&record("a1", 1, "b1")).unwrap();
        store.upsert(&damaged).unwrap();

        let mut found = store.annotations_for(UserId(1), "b1").unwrap();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(found[0], record("a1", 1, "b1"));
        assert!(found[1].highlighted_text.is_none());
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_sqlite_store_applies_patch() {
        let store = SqliteAnnotationStore::in_memory().unwrap();
        store.upsert(&record("a1", 1, "b1")).unwrap();

        let patch = AnnotationPatch {
            updated_annotations: vec![wire("a1"), wire("a4")],
            deleted_annotation_ids: vec![],
        };
        store.apply_upstream_mutation(UserId(1), "b1", &patch).unwrap();

        let found = store.annotations_for(UserId(1), "b1").unwrap();
        assert_eq!(found.len(), 2);
        let a1 = found.iter().find(|r| r.id == "a1").unwrap();
        assert_eq!(a1.kind, Some(AnnotationKind::Note));
        assert_eq!(a1.chapter_progress, Some(0.75));

        let patch = AnnotationPatch {
            updated_annotations: vec![],
            deleted_annotation_ids: vec!["a1".to_string(), "a4".to_string()],
        };
        store.apply_upstream_mutation(UserId(1), "b1", &patch).unwrap();
        assert!(store.annotations_for(UserId(1), "b1").unwrap().is_empty());
    }

    #[test]
    fn test_from_json_is_lenient() {
        let note = serde_json::json!({"id": "n1", "type": "note", "noteText": "x", "extra": 1});
        let record = LocalAnnotationRecord::from_json(UserId(1), "b1", &note).unwrap();
        assert_eq!(record.kind, Some(AnnotationKind::Note));
        assert_eq!(record.note_text.as_deref(), Some("x"));
        assert!(record.highlight_color.is_none());
        assert_eq!(record.raw, Some(note));

        let untyped = serde_json::json!({"id": "h1"});
        let record = LocalAnnotationRecord::from_json(UserId(1), "b1", &untyped).unwrap();
        assert_eq!(record.kind, Some(AnnotationKind::Highlight));

        assert!(LocalAnnotationRecord::from_json(UserId(1), "b1", &serde_json::json!({"id": ""})).is_none());
        assert!(LocalAnnotationRecord::from_json(UserId(1), "b1", &serde_json::json!({"type": "note"})).is_none());
    }

    #[test]
    fn test_incomplete_update_does_not_block_deletion() {
        let patch = AnnotationPatch::from_slice(
            br#"{"updatedAnnotations":[{"id":"n1","type":"note","noteText":"x"},{"type":"note"}],
                 "deletedAnnotationIds":["a1"]}"#,
        )
        .unwrap();

        let memory = MemoryAnnotationStore::new();
        memory.upsert(record("a1", 1, "b1"));
        memory.apply_upstream_mutation(UserId(1), "b1", &patch).unwrap();
        assert_eq!(ids(memory.annotations_for(UserId(1), "b1").unwrap()), vec!["n1"]);

        let sqlite = SqliteAnnotationStore::in_memory().unwrap();
        sqlite.upsert(&record("a1", 1, "b1")).unwrap();
        sqlite.apply_upstream_mutation(UserId(1), "b1", &patch).unwrap();
        assert_eq!(ids(sqlite.annotations_for(UserId(1), "b1").unwrap()), vec!["n1"]);
    }

    #[test]
    fn test_sqlite_store_keeps_raw_annotation() {
        let store = SqliteAnnotationStore::in_memory().unwrap();
        let mut annotation = wire("a1");
        annotation["location"]["span"]["startPath"] = serde_json::json!("span#k1");
        let patch = AnnotationPatch {
            updated_annotations: vec![annotation.clone()],
            deleted_annotation_ids: vec![],
        };
        store.apply_upstream_mutation(UserId(1), "b1", &patch).unwrap();

        let found = store.annotations_for(UserId(1), "b1").unwrap();
        assert_eq!(found[0].raw, Some(annotation));
    }
}
