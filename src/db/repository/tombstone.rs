use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{format_timestamp, parse_timestamp, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

/// Remember a deleted patient's key so reconciliation never re-imports it.
pub fn insert_tombstone(
    conn: &Connection,
    patient: &PatientRecord,
    deleted_at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO deleted_patients (natural_key, patient_id, full_name, deleted_at, external_removed)
         VALUES (?1, ?2, ?3, ?4, 0)
         ON CONFLICT(natural_key) DO UPDATE SET
            patient_id = excluded.patient_id,
            full_name = excluded.full_name,
            deleted_at = excluded.deleted_at,
            external_removed = 0,
            last_error = NULL,
            last_attempt_at = NULL",
        params![
            patient.natural_key.as_str(),
            patient.id.to_string(),
            patient.intake.full_name,
            format_timestamp(&deleted_at),
        ],
    )?;
    Ok(())
}

pub fn get_tombstone(
    conn: &Connection,
    key: &NaturalKey,
) -> Result<Option<DeletedPatient>, DatabaseError> {
    let result = conn.query_row(
        "SELECT natural_key, patient_id, full_name, deleted_at, external_removed, last_error,
         last_attempt_at
         FROM deleted_patients WHERE natural_key = ?1",
        params![key.as_str()],
        read_tombstone_row,
    );

    match result {
        Ok(row) => Ok(Some(tombstone_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_tombstoned_keys(conn: &Connection) -> Result<HashSet<NaturalKey>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT natural_key FROM deleted_patients")?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys.into_iter().map(NaturalKey::from_stored).collect())
}

/// Deletions whose spreadsheet row has not been confirmed removed.
pub fn list_pending_external_deletions(
    conn: &Connection,
) -> Result<Vec<DeletedPatient>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT natural_key, patient_id, full_name, deleted_at, external_removed, last_error,
         last_attempt_at
         FROM deleted_patients WHERE external_removed = 0
         ORDER BY deleted_at ASC",
    )?;
    let rows = stmt.query_map([], read_tombstone_row)?;

    let mut pending = Vec::new();
    for row in rows {
        pending.push(tombstone_from_row(row?)?);
    }
    Ok(pending)
}

pub fn mark_external_removed(
    conn: &Connection,
    key: &NaturalKey,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE deleted_patients
         SET external_removed = 1, last_error = NULL, last_attempt_at = ?2
         WHERE natural_key = ?1",
        params![key.as_str(), format_timestamp(&at)],
    )?;
    if updated == 0 {
        return Err(DatabaseError::not_found("DeletedPatient", key));
    }
    Ok(())
}

pub fn record_external_failure(
    conn: &Connection,
    key: &NaturalKey,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE deleted_patients
         SET external_removed = 0, last_error = ?2, last_attempt_at = ?3
         WHERE natural_key = ?1",
        params![key.as_str(), reason, format_timestamp(&at)],
    )?;
    if updated == 0 {
        return Err(DatabaseError::not_found("DeletedPatient", key));
    }
    Ok(())
}

struct TombstoneRow {
    natural_key: String,
    patient_id: String,
    full_name: String,
    deleted_at: String,
    external_removed: bool,
    last_error: Option<String>,
    last_attempt_at: Option<String>,
}

fn read_tombstone_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TombstoneRow> {
    Ok(TombstoneRow {
        natural_key: row.get(0)?,
        patient_id: row.get(1)?,
        full_name: row.get(2)?,
        deleted_at: row.get(3)?,
        external_removed: row.get(4)?,
        last_error: row.get(5)?,
        last_attempt_at: row.get(6)?,
    })
}

fn tombstone_from_row(row: TombstoneRow) -> Result<DeletedPatient, DatabaseError> {
    Ok(DeletedPatient {
        natural_key: NaturalKey::from_stored(row.natural_key),
        patient_id: parse_uuid(&row.patient_id)?,
        full_name: row.full_name,
        deleted_at: parse_timestamp(&row.deleted_at)?,
        external_removed: row.external_removed,
        last_error: row.last_error,
        last_attempt_at: row.last_attempt_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::test_support::intake;
    use crate::db::sqlite::open_memory_database;

    #[test]
    fn tombstone_starts_pending_and_clears_on_removal() {
        let conn = open_memory_database().unwrap();
        let patient = PatientRecord::from_intake(intake("1", "Maria Silva"));
        insert_tombstone(&conn, &patient, Utc::now()).unwrap();

        let pending = list_pending_external_deletions(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].full_name, "Maria Silva");
        assert!(!pending[0].external_removed);

        record_external_failure(&conn, &patient.natural_key, "timeout", Utc::now()).unwrap();
        let stone = get_tombstone(&conn, &patient.natural_key).unwrap().unwrap();
        assert_eq!(stone.last_error.as_deref(), Some("timeout"));
        assert!(stone.last_attempt_at.is_some());

        mark_external_removed(&conn, &patient.natural_key, Utc::now()).unwrap();
        assert!(list_pending_external_deletions(&conn).unwrap().is_empty());
        let stone = get_tombstone(&conn, &patient.natural_key).unwrap().unwrap();
        assert!(stone.external_removed);
        assert!(stone.last_error.is_none());

        assert!(list_tombstoned_keys(&conn).unwrap().contains(&patient.natural_key));
    }

    #[test]
    fn updating_unknown_tombstone_is_not_found() {
        let conn = open_memory_database().unwrap();
        let key = NaturalKey::derive("1", "Nobody");
        assert!(matches!(
            mark_external_removed(&conn, &key, Utc::now()),
            Err(DatabaseError::NotFound { .. })
        ));
        assert!(matches!(
            record_external_failure(&conn, &key, "x", Utc::now()),
            Err(DatabaseError::NotFound { .. })
        ));
    }
}
