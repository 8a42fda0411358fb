//! Patient deletion across the local store and the external source.
//!
//! Local first: the cascade and the tombstone commit in one transaction
//! before the source is contacted, so an outage never blocks removing a
//! patient. The external step can then fail on its own. That failure is an
//! outcome, not an error: the tombstone stays flagged as pending and can be
//! retried later.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{DatabaseError, PatientStore};
use crate::gateway::{DeleteOutcome, ExternalSource};
use crate::models::NaturalKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeletionOutcome {
    /// Removed locally and from the source (or the row was already gone).
    Deleted,
    /// Removed locally; the source row is still there.
    PartialFailure {
        patient_id: Uuid,
        natural_key: NaturalKey,
        detail: String,
    },
}

impl DeletionOutcome {
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::PartialFailure { .. })
    }
}

pub struct DeletionCoordinator<'a, S: ExternalSource + ?Sized> {
    store: &'a PatientStore,
    source: &'a S,
}

impl<'a, S: ExternalSource + ?Sized> DeletionCoordinator<'a, S> {
    pub fn new(store: &'a PatientStore, source: &'a S) -> Self {
        Self { store, source }
    }

    pub fn delete_patient(&self, id: &Uuid) -> Result<DeletionOutcome, DatabaseError> {
        let patient = self.store.delete(id)?;
        Ok(self.remove_external(&patient.id, &patient.natural_key))
    }

    /// Repeat only the external step for an already-deleted patient.
    pub fn retry_external_deletion(&self, key: &NaturalKey) -> Result<DeletionOutcome, DatabaseError> {
        let tombstone = self
            .store
            .tombstone(key)?
            .ok_or_else(|| DatabaseError::not_found("DeletedPatient", key))?;
        if tombstone.external_removed {
            return Ok(DeletionOutcome::Deleted);
        }
        Ok(self.remove_external(&tombstone.patient_id, key))
    }

    /// Both sides are settled by the time the tombstone is updated, so a
    /// bookkeeping failure is logged and the source outcome still returned.
    fn remove_external(&self, patient_id: &Uuid, key: &NaturalKey) -> DeletionOutcome {
        match self.source.delete_row(key) {
            Ok(outcome) => {
                if outcome == DeleteOutcome::NotFound {
                    tracing::info!(natural_key = %key, "Source row already absent");
                }
                if let Err(e) = self.store.mark_external_removed(key) {
                    tracing::error!(
                        natural_key = %key,
                        error = %e,
                        "Source row removed but tombstone not updated"
                    );
                }
                DeletionOutcome::Deleted
            }
            Err(e) => {
                let detail = e.to_string();
                tracing::warn!(
                    patient_id = %patient_id,
                    natural_key = %key,
                    error = %detail,
                    "Patient deleted locally, source row removal failed"
                );
                if let Err(e) = self.store.record_external_failure(key, &detail) {
                    tracing::error!(
                        natural_key = %key,
                        error = %e,
                        "Could not record source removal failure"
                    );
                }
                DeletionOutcome::PartialFailure {
                    patient_id: *patient_id,
                    natural_key: key.clone(),
                    detail,
                }
            }
        }
    }
}
