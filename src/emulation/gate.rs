// src/emulation/gate.rs
//! Forward-or-emulate decision
//!
//! Reads may be answered from local records when a fresh, non-empty set
//! exists for the requesting user. Writes are never answered locally: the
//! upstream service is the system of record for mutations.

use crate::emulation::store::{AnnotationStore, LocalAnnotationRecord, UserId};
use crate::relay::endpoint::Endpoint;
use crate::utils::config::EmulationConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Why the gate decided the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmulationReason {
    Ok,
    NoLocalRecord,
    UserMismatch,
    EndpointUnsupported,
    Stale,
    Disabled,
}

impl EmulationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmulationReason::Ok => "ok",
            EmulationReason::NoLocalRecord => "no-local-record",
            EmulationReason::UserMismatch => "user-mismatch",
            EmulationReason::EndpointUnsupported => "endpoint-unsupported",
            EmulationReason::Stale => "stale",
            EmulationReason::Disabled => "disabled",
        }
    }
}

impl fmt::Display for EmulationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulationDecision {
    pub emulate: bool,
    pub reason: EmulationReason,
}

impl EmulationDecision {
    pub fn forward(reason: EmulationReason) -> Self {
        Self {
            emulate: false,
            reason,
        }
    }

    pub fn emulate() -> Self {
        Self {
            emulate: true,
            reason: EmulationReason::Ok,
        }
    }
}

/// Decision plus the records that justified it, so the synthesizer does not
/// query the store a second time
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: EmulationDecision,
    pub records: Vec<LocalAnnotationRecord>,
}

impl Evaluation {
    fn forward(reason: EmulationReason) -> Self {
        Self {
            decision: EmulationDecision::forward(reason),
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmulationGate {
    enabled: bool,
    max_record_age: Option<Duration>,
}

impl EmulationGate {
    pub fn new(config: &EmulationConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_record_age: config.max_record_age(),
        }
    }

    pub fn decide(
        &self,
        endpoint: &Endpoint,
        user: Option<UserId>,
        store: &dyn AnnotationStore,
    ) -> EmulationDecision {
        self.evaluate(endpoint, user, store, Utc::now()).decision
    }

    /// Decide as of `now`. Reads the store, never writes it.
    pub fn evaluate(
        &self,
        endpoint: &Endpoint,
        user: Option<UserId>,
        store: &dyn AnnotationStore,
        now: DateTime<Utc>,
    ) -> Evaluation {
        if !endpoint.is_emulation_eligible() {
            return Evaluation::forward(EmulationReason::EndpointUnsupported);
        }
        if !self.enabled {
            return Evaluation::forward(EmulationReason::Disabled);
        }

        let book_id = match endpoint {
            Endpoint::GetAnnotations { book_id } => book_id,
            Endpoint::PatchAnnotations { .. }
            | Endpoint::CheckForChanges
            | Endpoint::UserStorage { .. }
            | Endpoint::Other => return Evaluation::forward(EmulationReason::EndpointUnsupported),
        };

        let Some(user) = user else {
            return Evaluation::forward(EmulationReason::UserMismatch);
        };

        let records = match store.annotations_for(user, book_id) {
            Ok(records) => records,
            Err(e) => {
                warn!("Annotation lookup failed for book {}: {}", book_id, e);
                return Evaluation::forward(EmulationReason::NoLocalRecord);
            }
        };

        if records.is_empty() {
            return Evaluation::forward(EmulationReason::NoLocalRecord);
        }
        if records.iter().any(|r| r.user_id != user || r.book_id != *book_id) {
            return Evaluation::forward(EmulationReason::UserMismatch);
        }
        if self.is_stale(&records, now) {
            return Evaluation::forward(EmulationReason::Stale);
        }

        debug!("Emulating {} with {} local records", endpoint.name(), records.len());
        Evaluation {
            decision: EmulationDecision::emulate(),
            records,
        }
    }

    /// Stale when the newest record is older than the configured age
    fn is_stale(&self, records: &[LocalAnnotationRecord], now: DateTime<Utc>) -> bool {
        let Some(max_age) = self.max_record_age else {
            return false;
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return false;
        };
        match records.iter().map(|r| r.last_modified).max() {
            Some(newest) => now.signed_duration_since(newest) > max_age,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::store::tests::record;
    use crate::emulation::store::MemoryAnnotationStore;
    use crate::emulation::wire::AnnotationPatch;
    use crate::utils::errors::StoreError;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn gate() -> EmulationGate {
        EmulationGate::new(&EmulationConfig::default())
    }

    fn get(book: &str) -> Endpoint {
        Endpoint::GetAnnotations { book_id: book.to_string() }
    }

    struct FailingStore;

    impl AnnotationStore for FailingStore {
        fn annotations_for(&self, _: UserId, _: &str) -> Result<Vec<LocalAnnotationRecord>, StoreError> {
            Err(StoreError::Unavailable("locked".into()))
        }

        fn apply_upstream_mutation(&self, _: UserId, _: &str, _: &AnnotationPatch) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("locked".into()))
        }
    }

    #[test]
    fn test_emulates_with_local_records() {
        let store = MemoryAnnotationStore::new();
        store.upsert(record("a1", 1, "b1"));

        let evaluation = gate().evaluate(&get("b1"), Some(UserId(1)), &store, Utc::now());
        assert_eq!(evaluation.decision, EmulationDecision::emulate());
        assert_eq!(evaluation.records.len(), 1);
    }

    #[test]
    fn test_no_local_record() {
        let store = MemoryAnnotationStore::new();
        let decision = gate().decide(&get("b1"), Some(UserId(1)), &store);
        assert!(!decision.emulate);
        assert_eq!(decision.reason.as_str(), "no-local-record");
    }

    #[test]
    fn test_missing_identity_is_user_mismatch() {
        let store = MemoryAnnotationStore::new();
        store.upsert(record("a1", 1, "b1"));
        let decision = gate().decide(&get("b1"), None, &store);
        assert_eq!(decision.reason, EmulationReason::UserMismatch);
    }

    #[test]
    fn test_store_failure_forwards() {
        let decision = gate().decide(&get("b1"), Some(UserId(1)), &FailingStore);
        assert_eq!(decision, EmulationDecision::forward(EmulationReason::NoLocalRecord));
    }

    #[test]
    fn test_disabled() {
        let store = MemoryAnnotationStore::new();
        store.upsert(record("a1", 1, "b1"));
        let gate = EmulationGate::new(&EmulationConfig {
            enabled: false,
            ..EmulationConfig::default()
        });
        assert_eq!(
            gate.decide(&get("b1"), Some(UserId(1)), &store).reason,
            EmulationReason::Disabled
        );
    }

    #[test]
    fn test_stale_records_forward() {
        let store = MemoryAnnotationStore::new();
        store.upsert(record("a1", 1, "b1")); // 2024-01-15T10:30:00Z
        let gate = EmulationGate::new(&EmulationConfig {
            max_record_age_secs: Some(3600),
            ..EmulationConfig::default()
        });

        let fresh = Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap();
        assert!(gate.evaluate(&get("b1"), Some(UserId(1)), &store, fresh).decision.emulate);
        assert_eq!(
            gate.evaluate(&get("b1"), Some(UserId(1)), &store, later).decision.reason,
            EmulationReason::Stale
        );
    }

    #[test]
    fn test_reason_tags() {
        assert_eq!(
            serde_json::to_string(&EmulationReason::EndpointUnsupported).unwrap(),
            "\"endpoint-unsupported\""
        );
        assert_eq!(EmulationReason::NoLocalRecord.to_string(), "no-local-record");
    }

    fn mutation_endpoint() -> impl Strategy<Value = Endpoint> {
        prop_oneof![
            "[a-z0-9-]{1,16}".prop_map(|book_id| Endpoint::PatchAnnotations { book_id }),
            "[A-Za-z/]{1,16}".prop_map(|subpath| Endpoint::UserStorage { subpath }),
            Just(Endpoint::Other),
        ]
    }

    proptest! {
        #[test]
        fn prop_mutations_never_emulated(
            endpoint in mutation_endpoint(),
            user in proptest::option::of(0i64..5),
            seeded in proptest::collection::vec((0i64..5, "[a-z0-9-]{1,16}"), 0..6),
        ) {
            let store = MemoryAnnotationStore::new();
            for (i, (owner, book)) in seeded.iter().enumerate() {
                store.upsert(record(&format!("a{}", i), *owner, book));
            }
            let decision = gate().decide(&endpoint, user.map(UserId), &store);
            prop_assert!(!decision.emulate);
            prop_assert_eq!(decision.reason, EmulationReason::EndpointUnsupported);
        }
    }
}
