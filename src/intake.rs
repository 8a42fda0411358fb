//! Layout of an intake response row and its conversion to `IntakeFields`.
//!
//! Column order follows the intake form: submission timestamp, email,
//! full name, age, contact, referral date, internment type, location,
//! procedure, diagnosis, condition severity.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{IntakeFields, NaturalKey};

pub const COL_SUBMITTED_AT: usize = 0;
pub const COL_EMAIL: usize = 1;
pub const COL_FULL_NAME: usize = 2;
pub const COL_AGE: usize = 3;
pub const COL_CONTACT: usize = 4;
pub const COL_REFERRAL_DATE: usize = 5;
pub const COL_INTERNMENT_TYPE: usize = 6;
pub const COL_LOCATION: usize = 7;
pub const COL_PROCEDURE: usize = 8;
pub const COL_DIAGNOSIS: usize = 9;
pub const COL_CONDITION_SEVERITY: usize = 10;

/// Minimum cells a complete response carries.
pub const INTAKE_COLUMNS: usize = 11;

/// One response row as the source returned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    /// Position among response rows, in source order (header excluded).
    pub position: usize,
    pub cells: Vec<String>,
}

impl RawRow {
    pub fn new(position: usize, cells: Vec<String>) -> Self {
        Self { position, cells }
    }

    fn cell(&self, col: usize) -> Option<&str> {
        self.cells.get(col).map(|c| c.trim())
    }

    /// Key of this row, or `None` when the identifying cells are blank.
    pub fn natural_key(&self) -> Option<NaturalKey> {
        let submitted_at = self.cell(COL_SUBMITTED_AT).filter(|c| !c.is_empty())?;
        let full_name = self.cell(COL_FULL_NAME).filter(|c| !c.is_empty())?;
        Some(NaturalKey::derive(submitted_at, full_name))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    #[error("row has {found} cells, expected at least {}", INTAKE_COLUMNS)]
    Incomplete { found: usize },

    #[error("missing value for {0}")]
    Missing(&'static str),

    #[error("invalid age '{0}'")]
    InvalidAge(String),

    #[error("unrecognized referral date '{0}'")]
    InvalidDate(String),
}

/// Convert a response row into intake fields.
pub fn parse_intake_row(row: &RawRow) -> Result<IntakeFields, IntakeError> {
    if row.cells.len() < INTAKE_COLUMNS {
        return Err(IntakeError::Incomplete {
            found: row.cells.len(),
        });
    }

    let required = |col: usize, name: &'static str| -> Result<String, IntakeError> {
        row.cell(col)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .ok_or(IntakeError::Missing(name))
    };

    let age_text = required(COL_AGE, "age")?;
    let age = age_text
        .parse::<u32>()
        .map_err(|_| IntakeError::InvalidAge(age_text.clone()))?;

    let date_text = required(COL_REFERRAL_DATE, "referral date")?;
    let referral_date =
        parse_sheet_date(&date_text).ok_or_else(|| IntakeError::InvalidDate(date_text.clone()))?;

    Ok(IntakeFields {
        submitted_at: required(COL_SUBMITTED_AT, "submission timestamp")?,
        email: row
            .cell(COL_EMAIL)
            .filter(|c| !c.is_empty())
            .map(str::to_string),
        full_name: required(COL_FULL_NAME, "full name")?,
        age,
        contact: required(COL_CONTACT, "contact")?,
        referral_date,
        internment_type: required(COL_INTERNMENT_TYPE, "internment type")?,
        location: required(COL_LOCATION, "location")?,
        procedure: required(COL_PROCEDURE, "procedure")?,
        diagnosis: required(COL_DIAGNOSIS, "diagnosis")?,
        condition_severity: required(COL_CONDITION_SEVERITY, "condition severity")?,
    })
}

/// Dates arrive as `dd/mm/yyyy` from the form, as ISO `yyyy-mm-dd` from
/// edited cells, or as `Date(y,m,d)` from some sheet exports.
pub fn parse_sheet_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%d/%m/%Y") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    let inner = value.strip_prefix("Date(")?.strip_suffix(')')?;
    let parts: Vec<i64> = inner
        .split(',')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [y, m, d] => NaiveDate::from_ymd_opt(
            i32::try_from(*y).ok()?,
            u32::try_from(*m).ok()?,
            u32::try_from(*d).ok()?,
        ),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Complete response row for the given identifying cells.
    pub(crate) fn row(submitted_at: &str, full_name: &str) -> Vec<String> {
        [
            submitted_at,
            "referrals@clinic.example",
            full_name,
            "54",
            "11987654321",
            "12/03/2024",
            "Elective",
            "Ward 3",
            "Knee arthroplasty",
            "Severe osteoarthritis",
            "High",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect()
    }
}
