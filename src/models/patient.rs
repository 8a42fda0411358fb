use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::natural_key::NaturalKey;

/// Demographic and referral data captured by the intake form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeFields {
    /// Submission timestamp exactly as the source reports it.
    pub submitted_at: String,
    /// Address of whoever filled in the form.
    pub email: Option<String>,
    pub full_name: String,
    pub age: u32,
    pub contact: String,
    pub referral_date: NaiveDate,
    pub internment_type: String,
    pub location: String,
    pub procedure: String,
    pub diagnosis: String,
    pub condition_severity: String,
}

impl IntakeFields {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::derive(&self.submitted_at, &self.full_name)
    }
}

/// One patient's intake, the root that owns all stage records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: Uuid,
    pub natural_key: NaturalKey,
    #[serde(flatten)]
    pub intake: IntakeFields,
    pub imported_at: DateTime<Utc>,
}

impl PatientRecord {
    /// Build a fresh record for a response seen for the first time.
    pub fn from_intake(intake: IntakeFields) -> Self {
        Self {
            id: Uuid::new_v4(),
            natural_key: intake.natural_key(),
            intake,
            imported_at: Utc::now(),
        }
    }
}

/// A deleted patient whose spreadsheet row may still need removing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedPatient {
    pub natural_key: NaturalKey,
    pub patient_id: Uuid,
    pub full_name: String,
    pub deleted_at: DateTime<Utc>,
    pub external_removed: bool,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}
