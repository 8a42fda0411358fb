//! Import of new intake rows from the external source.
//!
//! The source is authoritative for creation only. A pass fetches every row,
//! compares natural keys against the store (live patients and tombstones),
//! and creates a patient for each unseen key. Existing patients are never
//! updated or removed because of what the sheet says.
//!
//! The initial fetch is fail-closed: if it fails nothing is written. After
//! that each insert stands alone and a failing row is recorded in the
//! summary while the pass continues. Among rows sharing a key, the first
//! readable one wins.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{DatabaseError, PatientStore};
use crate::gateway::{ExternalSource, GatewayError};
use crate::intake::parse_intake_row;
use crate::models::{NaturalKey, PatientRecord};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Cannot fetch intake rows: {0}")]
    Source(#[from] GatewayError),

    #[error("Cannot read known patients: {0}")]
    Database(#[from] DatabaseError),
}

/// A row that could not be imported during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    pub position: usize,
    pub natural_key: Option<NaturalKey>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub imported: usize,
    /// Rows already present locally, including duplicates and tombstones.
    pub skipped: usize,
    /// Repeats of a key seen earlier in the same pass.
    pub duplicate_rows: usize,
    /// Rows belonging to deleted patients.
    pub tombstoned: usize,
    pub failures: Vec<RowFailure>,
}

impl ReconcileSummary {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct ReconciliationEngine<'a, S: ExternalSource + ?Sized> {
    store: &'a PatientStore,
    source: &'a S,
}

impl<'a, S: ExternalSource + ?Sized> ReconciliationEngine<'a, S> {
    pub fn new(store: &'a PatientStore, source: &'a S) -> Self {
        Self { store, source }
    }

    pub fn reconcile(&self) -> Result<ReconcileSummary, ReconcileError> {
        // Keys are read before the fetch; a key stored in between is caught
        // by the store's uniqueness constraint.
        let known = self.store.known_natural_keys()?;
        let rows = self.source.list_rows().map_err(|e| {
            tracing::warn!(error = %e, "Reconcile aborted, source fetch failed");
            e
        })?;

        let mut summary = ReconcileSummary::default();
        // Keys already handled in this pass. An unreadable row does not claim
        // its key, so a later readable repeat can still be imported.
        let mut seen: HashSet<NaturalKey> = HashSet::with_capacity(rows.len());

        for row in &rows {
            let Some(key) = row.natural_key() else {
                summary.failures.push(RowFailure {
                    position: row.position,
                    natural_key: None,
                    reason: "row has no submission timestamp or name".into(),
                });
                continue;
            };

            if seen.contains(&key) {
                tracing::warn!(
                    position = row.position,
                    natural_key = %key,
                    "Duplicate source row, keeping first occurrence"
                );
                summary.duplicate_rows += 1;
                summary.skipped += 1;
                continue;
            }

            if known.tombstoned.contains(&key) {
                tracing::debug!(natural_key = %key, "Row belongs to a deleted patient");
                seen.insert(key);
                summary.tombstoned += 1;
                summary.skipped += 1;
                continue;
            }

            if known.live.contains(&key) {
                seen.insert(key);
                summary.skipped += 1;
                continue;
            }

            let intake = match parse_intake_row(row) {
                Ok(intake) => intake,
                Err(e) => {
                    tracing::warn!(position = row.position, error = %e, "Unreadable intake row");
                    summary.failures.push(RowFailure {
                        position: row.position,
                        natural_key: Some(key),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            seen.insert(key.clone());

            let patient = PatientRecord::from_intake(intake);
            match self.store.create(&patient) {
                Ok(()) => summary.imported += 1,
                Err(e) => {
                    if matches!(e, DatabaseError::DuplicateKey(_)) {
                        tracing::error!(
                            natural_key = %key,
                            "Store rejected a key reconciliation considered new"
                        );
                    } else {
                        tracing::warn!(natural_key = %key, error = %e, "Patient import failed");
                    }
                    summary.failures.push(RowFailure {
                        position: row.position,
                        natural_key: Some(key),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            rows = rows.len(),
            imported = summary.imported,
            skipped = summary.skipped,
            duplicates = summary.duplicate_rows,
            tombstoned = summary.tombstoned,
            failures = summary.failures.len(),
            "Reconcile pass complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{DeleteOutcome, MockSource, RawRow};
    use crate::intake::{parse_intake_row, test_support::row};

    /// Source that stores a patient for `racer` while the pass is listing,
    /// after the engine has read the known keys.
    struct RacingSource<'a> {
        rows: MockSource,
        store: &'a PatientStore,
        racer: PatientRecord,
    }

    impl ExternalSource for RacingSource<'_> {
        fn list_rows(&self) -> Result<Vec<RawRow>, GatewayError> {
            self.store.create(&self.racer).unwrap();
            self.rows.list_rows()
        }

        fn delete_row(&self, key: &NaturalKey) -> Result<DeleteOutcome, GatewayError> {
            self.rows.delete_row(key)
        }
    }

    fn setup(rows: Vec<Vec<String>>) -> (PatientStore, MockSource) {
        (
            PatientStore::open_in_memory().unwrap(),
            MockSource::with_rows(rows),
        )
    }

    #[test]
    fn imports_new_rows_then_is_idempotent() {
        let (store, source) = setup(vec![row("1", "A"), row("2", "B")]);
        let engine = ReconciliationEngine::new(&store, &source);

        let first = engine.reconcile().unwrap();
        assert_eq!(first.imported, 2);
        assert_eq!(first.skipped, 0);

        let second = engine.reconcile().unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn duplicates_collapse_to_first_occurrence() {
        // 3 distinct keys, 4 repeats
        let mut first_a = row("1", "A");
        first_a[3] = "30".into();
        let mut repeat_a = row("1", "a ");
        repeat_a[3] = "99".into();
        let rows = vec![
            first_a,
            row("2", "B"),
            repeat_a,
            row("3", "C"),
            row("2", "B"),
            row("3", "C"),
            row("1", "A"),
        ];
        let (store, source) = setup(rows);
        let summary = ReconciliationEngine::new(&store, &source).reconcile().unwrap();

        assert_eq!(summary.imported, 3);
        assert_eq!(summary.duplicate_rows, 4);
        let patients = store.list().unwrap();
        assert_eq!(patients.len(), 3);
        let a = patients.iter().find(|p| p.intake.full_name == "A").unwrap();
        assert_eq!(a.intake.age, 30);
    }

    #[test]
    fn fetch_failure_imports_nothing() {
        let (store, source) = setup(vec![row("1", "A")]);
        source.fail_listing(Some(GatewayError::Timeout { secs: 30 }));

        let err = ReconciliationEngine::new(&store, &source).reconcile().unwrap_err();
        assert!(matches!(err, ReconcileError::Source(GatewayError::Timeout { secs: 30 })));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn tombstoned_keys_are_not_reimported() {
        let (store, source) = setup(vec![row("1", "A"), row("2", "B")]);
        let engine = ReconciliationEngine::new(&store, &source);
        engine.reconcile().unwrap();

        let a = store
            .list()
            .unwrap()
            .into_iter()
            .find(|p| p.intake.full_name == "A")
            .unwrap();
        store.delete(&a.id).unwrap();

        let summary = engine.reconcile().unwrap();
        assert_eq!(summary.imported, 0);
        assert_eq!(summary.tombstoned, 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn bad_rows_are_recorded_and_the_pass_continues() {
        let mut bad_age = row("2", "B");
        bad_age[3] = "unknown".into();
        let blank = vec![String::new(); 11];
        let (store, source) = setup(vec![row("1", "A"), bad_age, blank, row("3", "C")]);

        let summary = ReconciliationEngine::new(&store, &source).reconcile().unwrap();
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.failures.len(), 2);
        assert_eq!(summary.failures[0].position, 1);
        assert_eq!(summary.failures[0].natural_key, Some(NaturalKey::derive("2", "B")));
        assert!(summary.failures[1].natural_key.is_none());
        assert!(summary.has_failures());
    }

    #[test]
    fn rows_appearing_between_passes_are_picked_up() {
        let (store, source) = setup(vec![row("1", "A")]);
        let engine = ReconciliationEngine::new(&store, &source);
        assert_eq!(engine.reconcile().unwrap().imported, 1);

        // Someone removed A and added B in the sheet
        source.set_rows(vec![row("2", "B")]);
        let summary = engine.reconcile().unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn unreadable_first_row_does_not_block_a_readable_repeat() {
        let mut unreadable = row("1", "A");
        unreadable[3] = "fifty".into();
        let (store, source) = setup(vec![unreadable, row("1", "A")]);
        let engine = ReconciliationEngine::new(&store, &source);

        let first = engine.reconcile().unwrap();
        assert_eq!(first.imported, 1);
        assert_eq!(first.duplicate_rows, 0);
        assert_eq!(first.failures.len(), 1);
        assert_eq!(first.failures[0].position, 0);
        assert_eq!(store.list().unwrap()[0].intake.age, 54);

        let second = engine.reconcile().unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn key_stored_mid_pass_is_recorded_as_failure_and_pass_continues() {
        let store = PatientStore::open_in_memory().unwrap();
        let a = parse_intake_row(&RawRow::new(0, row("1", "A"))).unwrap();
        let source = RacingSource {
            rows: MockSource::with_rows(vec![row("1", "A"), row("2", "B")]),
            store: &store,
            racer: PatientRecord::from_intake(a),
        };

        let summary = ReconciliationEngine::new(&store, &source).reconcile().unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].natural_key, Some(NaturalKey::derive("1", "A")));
        assert!(summary.failures[0].reason.contains("Duplicate natural key"));
        assert_eq!(store.list().unwrap().len(), 2);
    }
}
