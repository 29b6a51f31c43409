// src/capture/sink.rs
//! Capture sinks
//!
//! The recorder hands redacted exchanges to a `CaptureSink`. Sinks are
//! injected by the caller at startup; the relay never owns a global one.

use crate::capture::exchange::Exchange;
use crate::utils::errors::CaptureError;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Destination for captured exchanges.
///
/// Called from a blocking worker, never from the response path.
pub trait CaptureSink: Send + Sync {
    /// Persist a batch in order; request halves precede their responses
    fn write_batch(&self, batch: &[Exchange]) -> Result<(), CaptureError>;

    fn name(&self) -> &'static str;
}

/// Emits each record as a structured `tracing` event on target `capture`
#[derive(Debug, Default)]
pub struct TracingSink;

impl CaptureSink for TracingSink {
    fn write_batch(&self, batch: &[Exchange]) -> Result<(), CaptureError> {
        for exchange in batch {
            for record in [&exchange.request, &exchange.response] {
                let json = serde_json::to_string(record)
                    .map_err(|e| CaptureError::SinkUnavailable(format!("Serialization error: {}", e)))?;
                info!(
                    target: "capture",
                    exchange_id = %exchange.id,
                    origin = exchange.origin.as_str(),
                    direction = ?record.direction,
                    record = %json,
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// SQLite-backed sink, one row per exchange half
pub struct SqliteSink {
    db: Mutex<Connection>,
}

impl SqliteSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            CaptureError::SinkUnavailable(format!("Failed to open database: {}", e))
        })?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, CaptureError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            CaptureError::SinkUnavailable(format!("Failed to open database: {}", e))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, CaptureError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS exchanges (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange_id TEXT NOT NULL,
                origin TEXT NOT NULL,
                direction TEXT NOT NULL,
                status INTEGER,
                record TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| CaptureError::SinkUnavailable(format!("Schema creation failed: {}", e)))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_exchange_id ON exchanges(exchange_id)",
            [],
        )
        .map_err(|e| CaptureError::SinkUnavailable(format!("Index creation failed: {}", e)))?;

        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Stored records for one exchange, in insertion order
    /// `(direction, record JSON)` rows of one exchange in write order
    pub fn records_for(&self, exchange_id: &str) -> Result<Vec<(String, String)>, CaptureError> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT direction, record FROM exchanges WHERE exchange_id = ? ORDER BY seq")
            .map_err(|e| CaptureError::SinkUnavailable(format!("Query preparation failed: {}", e)))?;

        let rows = stmt
            .query_map(params![exchange_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| CaptureError::SinkUnavailable(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CaptureError::SinkUnavailable(format!("Result collection failed: {}", e)))?;

        Ok(rows)
    }

    /// Rows written so far; two per exchange
    pub fn count(&self) -> Result<u64, CaptureError> {
        let db = self.db.lock();
        let n: i64 = db
            .query_row("SELECT COUNT(*) FROM exchanges", [], |row| row.get(0))
            .map_err(|e| CaptureError::SinkUnavailable(format!("Count failed: {}", e)))?;
        Ok(n as u64)
    }
}

impl CaptureSink for SqliteSink {
    fn write_batch(&self, batch: &[Exchange]) -> Result<(), CaptureError> {
        let mut db = self.db.lock();
        let tx = db
            .transaction()
            .map_err(|e| CaptureError::SinkUnavailable(format!("Transaction failed: {}", e)))?;

        for exchange in batch {
            for record in [&exchange.request, &exchange.response] {
                let json = serde_json::to_string(record)
                    .map_err(|e| CaptureError::SinkUnavailable(format!("Serialization error: {}", e)))?;
                let direction = serde_json::to_value(record.direction)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();

                tx.execute(
                    r#"
                    INSERT INTO exchanges (exchange_id, origin, direction, status, record, created_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                    params![
                        exchange.id.to_string(),
                        exchange.origin.as_str(),
                        direction,
                        record.status,
                        json,
                        record.timestamp.timestamp(),
                    ],
                )
                .map_err(|e| CaptureError::SinkUnavailable(format!("Insert failed: {}", e)))?;
            }
        }

        tx.commit()
            .map_err(|e| CaptureError::SinkUnavailable(format!("Commit failed: {}", e)))?;

        debug!("Wrote {} exchanges to sqlite sink", batch.len());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Keeps exchanges in memory; used by tests and embedders
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    exchanges: Arc<Mutex<Vec<Exchange>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.exchanges.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.exchanges.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.lock().is_empty()
    }
}

impl CaptureSink for MemorySink {
    fn write_batch(&self, batch: &[Exchange]) -> Result<(), CaptureError> {
        self.exchanges.lock().extend(batch.iter().cloned());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::exchange::{ExchangeRecord, Origin};
    use bytes::Bytes;
    use hyper::{HeaderMap, Method, StatusCode};
    use tempfile::tempdir;
    use ulid::Ulid;

    fn sample_exchange() -> Exchange {
        let request = ExchangeRecord::request(
            Ulid::new(),
            &Method::GET,
            "/readingservices/[REDACTED]/api/v3/content/b1/annotations",
            Some("limit=5"),
            &HeaderMap::new(),
            Bytes::new(),
        );
        let response = ExchangeRecord::response(
            &request,
            StatusCode::OK,
            &HeaderMap::new(),
            Bytes::from_static(b"[]"),
        );
        Exchange::new(Origin::Forwarded, request, response)
    }

    #[test]
    fn test_sqlite_sink_keeps_request_before_response() {
        let dir = tempdir().unwrap();
        let sink = SqliteSink::open(dir.path().join("capture.db")).unwrap();
        let exchange = sample_exchange();

        sink.write_batch(std::slice::from_ref(&exchange)).unwrap();

        let rows = sink.records_for(&exchange.id.to_string()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "request");
        assert_eq!(rows[1].0, "response");
        assert_eq!(sink.count().unwrap(), 2);
    }

    #[test]
    fn test_sqlite_sink_stores_binary_body() {
        let sink = SqliteSink::in_memory().unwrap();
        let request = ExchangeRecord::request(
            Ulid::new(),
            &Method::POST,
            "/readingservices/[REDACTED]/api/UserStorage/Metadata",
            None,
            &HeaderMap::new(),
            Bytes::from_static(&[0xff, 0x00, 0xfe, 0x41]),
        );
        let response =
            ExchangeRecord::response(&request, StatusCode::OK, &HeaderMap::new(), Bytes::new());
        let exchange = Exchange::new(Origin::Forwarded, request, response);

        sink.write_batch(std::slice::from_ref(&exchange)).unwrap();

        let rows = sink.records_for(&exchange.id.to_string()).unwrap();
        let record: serde_json::Value = serde_json::from_str(&rows[0].1).unwrap();
        assert_eq!(record["body"]["size"], 4);
        assert_eq!(record["body"]["raw_base64"], "/wD+QQ==");
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        sink.write_batch(&[sample_exchange(), sample_exchange()]).unwrap();
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_tracing_sink_accepts_batch() {
        assert!(TracingSink.write_batch(&[sample_exchange()]).is_ok());
    }
}
