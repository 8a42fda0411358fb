//! `PatientStore`: the transactional surface over the repository layer.
//!
//! Every mutation runs in an `IMMEDIATE` transaction, which takes SQLite's
//! writer lock up front. A second writer (another handle on the same file,
//! or another process) blocks until the first commits, so concurrent stage
//! submissions never interleave into a torn record. Within one handle the
//! connection mutex already serializes callers.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use uuid::Uuid;

use super::repository::{self, ConsistencyReport};
use super::{sqlite, DatabaseError};
use crate::models::*;

pub struct PatientStore {
    conn: Mutex<Connection>,
}

impl PatientStore {
    /// Open (or create) the store at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(sqlite::open_database(path)?))
    }

    /// In-memory store (for testing and offline runs).
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(sqlite::open_memory_database()?))
    }

    /// Wrap a connection that has already been migrated.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    // ── Patients ────────────────────────────────────────────

    /// Insert a new patient. Fails with `DuplicateKey` when the natural key
    /// is already stored, whatever the caller believed.
    pub fn create(&self, patient: &PatientRecord) -> Result<(), DatabaseError> {
        let conn = self.lock()?;
        repository::insert_patient(&conn, patient)?;
        tracing::info!(
            patient_id = %patient.id,
            natural_key = %patient.natural_key,
            "Patient created"
        );
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Result<PatientRecord, DatabaseError> {
        let conn = self.lock()?;
        repository::get_patient(&conn, id)?.ok_or_else(|| DatabaseError::not_found("Patient", id))
    }

    pub fn list(&self) -> Result<Vec<PatientRecord>, DatabaseError> {
        let conn = self.lock()?;
        repository::list_patients(&conn)
    }

    pub fn search(&self, query: &str) -> Result<Vec<PatientRecord>, DatabaseError> {
        let conn = self.lock()?;
        repository::search_patients(&conn, query)
    }

    /// Patient plus its stage records, read from a single snapshot.
    pub fn get_with_stages(&self, id: &Uuid) -> Result<(PatientRecord, StageSet), DatabaseError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let patient = repository::get_patient(&tx, id)?
            .ok_or_else(|| DatabaseError::not_found("Patient", id))?;
        let stages = repository::get_stages(&tx, id)?;
        tx.commit()?;
        Ok((patient, stages))
    }

    /// Stage records for an existing patient.
    pub fn stages(&self, id: &Uuid) -> Result<StageSet, DatabaseError> {
        self.get_with_stages(id).map(|(_, stages)| stages)
    }

    /// Every patient (or every search match) with the kinds of stage it owns.
    pub fn list_with_stage_kinds(
        &self,
        query: Option<&str>,
    ) -> Result<Vec<(PatientRecord, BTreeSet<StageKind>)>, DatabaseError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let patients = match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => repository::search_patients(&tx, q)?,
            None => repository::list_patients(&tx)?,
        };
        let mut listed = Vec::with_capacity(patients.len());
        for patient in patients {
            let kinds = repository::get_stage_kinds(&tx, &patient.id)?;
            listed.push((patient, kinds.into_iter().collect()));
        }
        tx.commit()?;
        Ok(listed)
    }

    /// Natural keys that reconciliation must not import: live patients and
    /// tombstoned (deleted) ones.
    pub fn known_natural_keys(&self) -> Result<KnownKeys, DatabaseError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let live = repository::list_patient_keys(&tx)?;
        let tombstoned = repository::list_tombstoned_keys(&tx)?;
        tx.commit()?;
        Ok(KnownKeys { live, tombstoned })
    }

    // ── Stages ──────────────────────────────────────────────

    /// Create or overwrite the patient's record for `data`'s stage.
    pub fn upsert_stage(&self, patient_id: &Uuid, data: &StageData) -> Result<StageRecord, DatabaseError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if repository::get_patient(&tx, patient_id)?.is_none() {
            return Err(DatabaseError::not_found("Patient", patient_id));
        }
        let record = repository::upsert_stage(&tx, patient_id, data, Utc::now())?;
        tx.commit()?;

        tracing::info!(
            patient_id = %patient_id,
            stage = %record.kind(),
            "Stage recorded"
        );
        Ok(record)
    }

    pub fn count_stage_rows(&self, patient_id: &Uuid) -> Result<i64, DatabaseError> {
        let conn = self.lock()?;
        repository::count_stage_rows(&conn, patient_id)
    }

    // ── Deletion ────────────────────────────────────────────

    /// Atomically delete the patient, all of its stage records, and write
    /// its tombstone. Returns the deleted record.
    pub fn delete(&self, id: &Uuid) -> Result<PatientRecord, DatabaseError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let patient = repository::get_patient(&tx, id)?
            .ok_or_else(|| DatabaseError::not_found("Patient", id))?;
        let stages_deleted = repository::delete_patient_cascade(&tx, id)?;
        repository::insert_tombstone(&tx, &patient, Utc::now())?;
        tx.commit()?;

        tracing::info!(
            patient_id = %id,
            natural_key = %patient.natural_key,
            stages = stages_deleted,
            "Patient deleted"
        );
        Ok(patient)
    }

    pub fn tombstone(&self, key: &NaturalKey) -> Result<Option<DeletedPatient>, DatabaseError> {
        let conn = self.lock()?;
        repository::get_tombstone(&conn, key)
    }

    pub fn pending_external_deletions(&self) -> Result<Vec<DeletedPatient>, DatabaseError> {
        let conn = self.lock()?;
        repository::list_pending_external_deletions(&conn)
    }

    pub fn mark_external_removed(&self, key: &NaturalKey) -> Result<(), DatabaseError> {
        let conn = self.lock()?;
        repository::mark_external_removed(&conn, key, Utc::now())
    }

    pub fn record_external_failure(&self, key: &NaturalKey, reason: &str) -> Result<(), DatabaseError> {
        let conn = self.lock()?;
        repository::record_external_failure(&conn, key, reason, Utc::now())
    }

    // ── Maintenance ─────────────────────────────────────────

    pub fn check_consistency(&self) -> Result<ConsistencyReport, DatabaseError> {
        let conn = self.lock()?;
        repository::check_consistency(&conn)
    }
}

/// Keys already accounted for in the store.
#[derive(Debug, Clone, Default)]
pub struct KnownKeys {
    pub live: HashSet<NaturalKey>,
    pub tombstoned: HashSet<NaturalKey>,
}
