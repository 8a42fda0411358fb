use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::StageKind;

/// Case evaluation performed by the specialist.
///
/// "OPME" covers orthoses, prostheses and special materials that must be
/// requested separately from the procedure itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentData {
    pub evaluation_date: NaiveDate,
    pub diagnosis: String,
    pub severity: String,
    pub procedure_requested: String,
    pub requester: Option<String>,
    pub opme_needed: bool,
    pub special_opme: bool,
    pub previous_complications: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationData {
    pub opme_authorized: bool,
    pub scheduling_date: Option<NaiveDate>,
    pub execution_date: Option<NaiveDate>,
    pub execution_time: Option<NaiveTime>,
    pub cancellation_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureExecutionData {
    pub execution_date: NaiveDate,
    pub medical_report: Option<String>,
    pub patient_informed: bool,
    pub previous_complications: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpData {
    pub post_procedure_complications: bool,
}

/// Payload submitted for one workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum StageData {
    Assessment(AssessmentData),
    Authorization(AuthorizationData),
    ProcedureExecution(ProcedureExecutionData),
    FollowUp(FollowUpData),
}

impl StageData {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Assessment(_) => StageKind::Assessment,
            Self::Authorization(_) => StageKind::Authorization,
            Self::ProcedureExecution(_) => StageKind::ProcedureExecution,
            Self::FollowUp(_) => StageKind::FollowUp,
        }
    }
}

/// Persisted data for one step, owned one-to-one by a patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub data: StageData,
    /// Set when the step was first recorded; kept across corrections.
    pub completed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn kind(&self) -> StageKind {
        self.data.kind()
    }
}

/// Snapshot of the stage records a patient owns, at most one per kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSet {
    records: BTreeMap<StageKind, StageRecord>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any record of the same kind.
    pub fn insert(&mut self, record: StageRecord) {
        self.records.insert(record.kind(), record);
    }

    pub fn get(&self, kind: StageKind) -> Option<&StageRecord> {
        self.records.get(&kind)
    }

    /// Kinds present, in workflow order.
    pub fn kinds(&self) -> BTreeSet<StageKind> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<StageRecord> for StageSet {
    fn from_iter<I: IntoIterator<Item = StageRecord>>(iter: I) -> Self {
        let mut set = Self::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}
