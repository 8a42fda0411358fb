//! Consumer-facing operations for the UI layer.
//!
//! Listing triggers a reconcile pass first. When the source is down the
//! already-imported patients are still returned, marked stale. Every read
//! recomputes the workflow state from the stored stage records.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{ConsistencyReport, DatabaseError, PatientStore};
use crate::deletion::{DeletionCoordinator, DeletionOutcome};
use crate::gateway::{ExternalSource, GatewayError};
use crate::models::{DeletedPatient, NaturalKey, PatientRecord, StageData, StageSet};
use crate::reconcile::{ReconcileError, ReconcileSummary, ReconciliationEngine};
use crate::workflow::{self, WorkflowState};

/// Error categories the UI distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Transient; the user may retry.
    SourceUnavailable,
    /// A defect in key derivation or reconciliation.
    DuplicateKey,
    NotFound,
    /// Deleted locally; offer a retry of the external step only.
    PartialDeletionFailure,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable => "SOURCE_UNAVAILABLE",
            Self::DuplicateKey => "DUPLICATE_KEY",
            Self::NotFound => "NOT_FOUND",
            Self::PartialDeletionFailure => "PARTIAL_DELETION_FAILURE",
            Self::Internal => "INTERNAL",
        }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Source(#[from] GatewayError),

    #[error("Patient {patient_id} deleted locally but its source row remains: {detail}")]
    PartialDeletion {
        patient_id: Uuid,
        natural_key: NaturalKey,
        detail: String,
    },
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(DatabaseError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Database(DatabaseError::DuplicateKey(_)) => ErrorKind::DuplicateKey,
            Self::Database(_) => ErrorKind::Internal,
            Self::Source(_) => ErrorKind::SourceUnavailable,
            Self::PartialDeletion { .. } => ErrorKind::PartialDeletionFailure,
        }
    }
}

impl From<ReconcileError> for ServiceError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Source(e) => Self::Source(e),
            ReconcileError::Database(e) => Self::Database(e),
        }
    }
}

/// Outcome of the reconcile pass that preceded a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    Synced(ReconcileSummary),
    /// The source could not be read; the list shows what was already imported.
    Stale { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientOverview {
    pub patient: PatientRecord,
    pub workflow: WorkflowState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientListing {
    pub patients: Vec<PatientOverview>,
    pub sync: SyncStatus,
    /// Deleted patients whose source row still needs removing.
    pub pending_deletions: Vec<DeletedPatient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientDetail {
    pub patient: PatientRecord,
    pub stages: StageSet,
    pub workflow: WorkflowState,
}

pub struct PatientService<S: ExternalSource> {
    store: PatientStore,
    source: S,
}

impl<S: ExternalSource> PatientService<S> {
    pub fn new(store: PatientStore, source: S) -> Self {
        Self { store, source }
    }

    /// Run a reconcile pass and report its summary.
    pub fn sync(&self) -> Result<ReconcileSummary, ServiceError> {
        Ok(ReconciliationEngine::new(&self.store, &self.source).reconcile()?)
    }

    /// Reconcile, then list every patient with its workflow state.
    pub fn list_patients(&self) -> Result<PatientListing, ServiceError> {
        let sync = match self.sync() {
            Ok(summary) => SyncStatus::Synced(summary),
            Err(e) => {
                tracing::warn!(error = %e, "Listing patients without a fresh sync");
                SyncStatus::Stale {
                    reason: e.to_string(),
                }
            }
        };

        Ok(PatientListing {
            patients: self.overviews(None)?,
            sync,
            pending_deletions: self.store.pending_external_deletions()?,
        })
    }

    /// Case-insensitive name search over imported patients. No sync.
    pub fn search_patients(&self, query: &str) -> Result<Vec<PatientOverview>, ServiceError> {
        self.overviews(Some(query))
    }

    fn overviews(&self, query: Option<&str>) -> Result<Vec<PatientOverview>, ServiceError> {
        let listed = self.store.list_with_stage_kinds(query)?;
        Ok(listed
            .into_iter()
            .map(|(patient, kinds)| {
                let workflow = workflow::evaluate(&kinds);
                warn_if_inconsistent(&patient.id, &workflow);
                PatientOverview { patient, workflow }
            })
            .collect())
    }

    pub fn get_patient(&self, id: &Uuid) -> Result<PatientDetail, ServiceError> {
        let (patient, stages) = self.store.get_with_stages(id)?;
        let workflow = workflow::evaluate_stages(&stages);
        warn_if_inconsistent(&patient.id, &workflow);
        Ok(PatientDetail {
            patient,
            stages,
            workflow,
        })
    }

    /// Record (or correct) one step and return the resulting workflow state.
    pub fn submit_stage(&self, id: &Uuid, data: StageData) -> Result<WorkflowState, ServiceError> {
        self.store.upsert_stage(id, &data)?;
        let stages = self.store.stages(id)?;
        let workflow = workflow::evaluate_stages(&stages);
        warn_if_inconsistent(id, &workflow);
        Ok(workflow)
    }

    /// Delete locally, then from the source. A source failure surfaces as
    /// `PartialDeletionFailure` after the local delete has committed.
    pub fn delete_patient(&self, id: &Uuid) -> Result<(), ServiceError> {
        let outcome = DeletionCoordinator::new(&self.store, &self.source).delete_patient(id)?;
        outcome_to_result(outcome)
    }

    pub fn pending_external_deletions(&self) -> Result<Vec<DeletedPatient>, ServiceError> {
        Ok(self.store.pending_external_deletions()?)
    }

    pub fn retry_external_deletion(&self, key: &NaturalKey) -> Result<(), ServiceError> {
        let outcome =
            DeletionCoordinator::new(&self.store, &self.source).retry_external_deletion(key)?;
        outcome_to_result(outcome)
    }

    pub fn check_consistency(&self) -> Result<ConsistencyReport, ServiceError> {
        Ok(self.store.check_consistency()?)
    }
}

fn outcome_to_result(outcome: DeletionOutcome) -> Result<(), ServiceError> {
    match outcome {
        DeletionOutcome::Deleted => Ok(()),
        DeletionOutcome::PartialFailure {
            patient_id,
            natural_key,
            detail,
        } => Err(ServiceError::PartialDeletion {
            patient_id,
            natural_key,
            detail,
        }),
    }
}

fn warn_if_inconsistent(patient_id: &Uuid, workflow: &WorkflowState) {
    if let Some(anomaly) = &workflow.anomaly {
        tracing::warn!(patient_id = %patient_id, anomaly = %anomaly, "Inconsistent workflow");
    }
}
