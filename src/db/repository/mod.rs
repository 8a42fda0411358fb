//! Repository layer: entity-scoped database operations.
//!
//! Free functions over `&Connection` so they compose inside a caller's
//! transaction (`Transaction` derefs to `Connection`). The transactional
//! boundaries themselves live in `db::store`.

mod consistency;
mod patient;
mod stage;
mod tombstone;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use uuid::Uuid;

use super::DatabaseError;

pub use consistency::*;
pub use patient::*;
pub use stage::*;
pub use tombstone::*;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad timestamp '{value}': {e}")))
}

pub(crate) fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(value: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad date '{value}': {e}")))
}

pub(crate) fn format_time(time: &NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub(crate) fn parse_time(value: &str) -> Result<NaiveTime, DatabaseError> {
    NaiveTime::parse_from_str(value, TIME_FORMAT)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad time '{value}': {e}")))
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(value).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}
