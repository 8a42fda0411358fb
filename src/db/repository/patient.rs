use std::collections::HashSet;

use rusqlite::{params, Connection, ErrorCode};
use uuid::Uuid;

use super::{format_date, format_timestamp, parse_date, parse_timestamp, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

const PATIENT_COLUMNS: &str = "id, natural_key, submitted_at, email, full_name, age, contact,
     referral_date, internment_type, location, procedure, diagnosis, condition_severity,
     imported_at";

/// Insert a patient. A colliding natural key fails with `DuplicateKey`.
pub fn insert_patient(conn: &Connection, patient: &PatientRecord) -> Result<(), DatabaseError> {
    let intake = &patient.intake;
    let result = conn.execute(
        "INSERT INTO patients (id, natural_key, submitted_at, email, full_name, search_name, age,
         contact, referral_date, internment_type, location, procedure, diagnosis,
         condition_severity, imported_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            patient.id.to_string(),
            patient.natural_key.as_str(),
            intake.submitted_at,
            intake.email,
            intake.full_name,
            fold_name(&intake.full_name),
            intake.age,
            intake.contact,
            format_date(&intake.referral_date),
            intake.internment_type,
            intake.location,
            intake.procedure,
            intake.diagnosis,
            intake.condition_severity,
            format_timestamp(&patient.imported_at),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Err(DatabaseError::DuplicateKey(patient.natural_key.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_patient(conn: &Connection, id: &Uuid) -> Result<Option<PatientRecord>, DatabaseError> {
    let sql = format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = ?1");
    let result = conn.query_row(&sql, params![id.to_string()], read_patient_row);

    match result {
        Ok(row) => Ok(Some(patient_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All patients, oldest import first.
pub fn list_patients(conn: &Connection) -> Result<Vec<PatientRecord>, DatabaseError> {
    let sql = format!("SELECT {PATIENT_COLUMNS} FROM patients ORDER BY imported_at ASC, rowid ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], read_patient_row)?;

    let mut patients = Vec::new();
    for row in rows {
        patients.push(patient_from_row(row?)?);
    }
    Ok(patients)
}

/// Case-insensitive substring match on the patient's name, accents included.
pub fn search_patients(conn: &Connection, query: &str) -> Result<Vec<PatientRecord>, DatabaseError> {
    let pattern = format!("%{}%", escape_like(&fold_name(query.trim())));
    let sql = format!(
        "SELECT {PATIENT_COLUMNS} FROM patients
         WHERE search_name LIKE ?1 ESCAPE '\\'
         ORDER BY imported_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![pattern], read_patient_row)?;

    let mut patients = Vec::new();
    for row in rows {
        patients.push(patient_from_row(row?)?);
    }
    Ok(patients)
}

pub fn list_patient_keys(conn: &Connection) -> Result<HashSet<NaturalKey>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT natural_key FROM patients")?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys.into_iter().map(NaturalKey::from_stored).collect())
}

/// Delete a patient together with every stage record it owns.
///
/// Stage foreign keys do not cascade, so children go first. Callers must
/// run this inside a transaction; the store does.
pub fn delete_patient_cascade(conn: &Connection, patient_id: &Uuid) -> Result<usize, DatabaseError> {
    let stages_deleted = super::delete_stages(conn, patient_id)?;

    let deleted = conn.execute(
        "DELETE FROM patients WHERE id = ?1",
        params![patient_id.to_string()],
    )?;
    if deleted == 0 {
        return Err(DatabaseError::not_found("Patient", patient_id));
    }

    tracing::debug!(
        patient_id = %patient_id,
        stages = stages_deleted,
        "Patient cascade-deleted with all stage records"
    );
    Ok(stages_deleted)
}

/// Search form of a name. SQLite's `lower()` and `LIKE` fold ASCII only.
fn fold_name(name: &str) -> String {
    name.to_lowercase()
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// Internal row type for PatientRecord mapping
struct PatientRow {
    id: String,
    natural_key: String,
    submitted_at: String,
    email: Option<String>,
    full_name: String,
    age: u32,
    contact: String,
    referral_date: String,
    internment_type: String,
    location: String,
    procedure: String,
    diagnosis: String,
    condition_severity: String,
    imported_at: String,
}

fn read_patient_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PatientRow> {
    Ok(PatientRow {
        id: row.get(0)?,
        natural_key: row.get(1)?,
        submitted_at: row.get(2)?,
        email: row.get(3)?,
        full_name: row.get(4)?,
        age: row.get(5)?,
        contact: row.get(6)?,
        referral_date: row.get(7)?,
        internment_type: row.get(8)?,
        location: row.get(9)?,
        procedure: row.get(10)?,
        diagnosis: row.get(11)?,
        condition_severity: row.get(12)?,
        imported_at: row.get(13)?,
    })
}

fn patient_from_row(row: PatientRow) -> Result<PatientRecord, DatabaseError> {
    Ok(PatientRecord {
        id: parse_uuid(&row.id)?,
        natural_key: NaturalKey::from_stored(row.natural_key),
        intake: IntakeFields {
            submitted_at: row.submitted_at,
            email: row.email,
            full_name: row.full_name,
            age: row.age,
            contact: row.contact,
            referral_date: parse_date(&row.referral_date)?,
            internment_type: row.internment_type,
            location: row.location,
            procedure: row.procedure,
            diagnosis: row.diagnosis,
            condition_severity: row.condition_severity,
        },
        imported_at: parse_timestamp(&row.imported_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::test_support::*;
    use crate::db::sqlite::open_memory_database;

    #[test]
    fn patient_insert_and_retrieve() {
        let conn = open_memory_database().unwrap();
        let patient = PatientRecord::from_intake(intake("12/03/2024 10:15:00", "Maria Silva"));
        insert_patient(&conn, &patient).unwrap();

        let loaded = get_patient(&conn, &patient.id).unwrap().unwrap();
        assert_eq!(loaded.intake, patient.intake);
        assert_eq!(loaded.natural_key, patient.natural_key);
    }

    #[test]
    fn missing_patient_is_none() {
        let conn = open_memory_database().unwrap();
        assert!(get_patient(&conn, &Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn colliding_natural_key_is_duplicate_key() {
        let conn = open_memory_database().unwrap();
        let first = PatientRecord::from_intake(intake("12/03/2024 10:15:00", "Maria Silva"));
        let second = PatientRecord::from_intake(intake("12/03/2024 10:15:00", "maria  silva"));
        assert_eq!(first.natural_key, second.natural_key);

        insert_patient(&conn, &first).unwrap();
        let err = insert_patient(&conn, &second).unwrap_err();
        assert!(matches!(err, DatabaseError::DuplicateKey(ref k) if k == first.natural_key.as_str()));
        assert_eq!(list_patients(&conn).unwrap().len(), 1);
    }

    #[test]
    fn search_is_case_insensitive_and_escapes_wildcards() {
        let conn = open_memory_database().unwrap();
        insert_patient(&conn, &PatientRecord::from_intake(intake("1", "Maria Silva"))).unwrap();
        insert_patient(&conn, &PatientRecord::from_intake(intake("2", "João Souza"))).unwrap();
        insert_patient(&conn, &PatientRecord::from_intake(intake("3", "Ana 100% Lima"))).unwrap();

        let found = search_patients(&conn, "SILVA").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].intake.full_name, "Maria Silva");

        let literal = search_patients(&conn, "100%").unwrap();
        assert_eq!(literal.len(), 1);
        assert_eq!(search_patients(&conn, "%").unwrap().len(), 1);
    }

    #[test]
    fn search_folds_accented_letters() {
        let conn = open_memory_database().unwrap();
        insert_patient(&conn, &PatientRecord::from_intake(intake("1", "JOÃO SOUZA"))).unwrap();
        insert_patient(&conn, &PatientRecord::from_intake(intake("2", "Ângela Lima"))).unwrap();
        insert_patient(&conn, &PatientRecord::from_intake(intake("3", "Maria Silva"))).unwrap();

        let joao = search_patients(&conn, "joão").unwrap();
        assert_eq!(joao.len(), 1);
        assert_eq!(joao[0].intake.full_name, "JOÃO SOUZA");

        let angela = search_patients(&conn, "ÂNGELA").unwrap();
        assert_eq!(angela.len(), 1);
        assert_eq!(angela[0].intake.full_name, "Ângela Lima");

        assert_eq!(search_patients(&conn, "lima").unwrap().len(), 1);
    }

    #[test]
    fn list_keys_returns_every_patient() {
        let conn = open_memory_database().unwrap();
        let a = PatientRecord::from_intake(intake("1", "A"));
        let b = PatientRecord::from_intake(intake("2", "B"));
        insert_patient(&conn, &a).unwrap();
        insert_patient(&conn, &b).unwrap();

        let keys = list_patient_keys(&conn).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&a.natural_key));
        assert!(keys.contains(&b.natural_key));
        assert_eq!(list_patients(&conn).unwrap().len(), 2);
    }

    #[test]
    fn bare_parent_delete_is_rejected_while_stages_exist() {
        let conn = open_memory_database().unwrap();
        let patient = PatientRecord::from_intake(intake("1", "A"));
        insert_patient(&conn, &patient).unwrap();
        crate::db::repository::upsert_stage(&conn, &patient.id, &assessment(), chrono::Utc::now())
            .unwrap();

        let result = conn.execute(
            "DELETE FROM patients WHERE id = ?1",
            params![patient.id.to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn cascade_delete_of_unknown_patient_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err = delete_patient_cascade(&conn, &Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}
