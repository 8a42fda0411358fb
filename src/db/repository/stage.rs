use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{format_date, format_time, format_timestamp, parse_date, parse_time, parse_timestamp, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

/// Create or overwrite the patient's record for this stage.
///
/// The UNIQUE on `patient_id` makes this a true one-to-one: a second
/// submission updates the existing row in place. `completed_at` keeps the
/// first submission time; `updated_at` moves to `now`.
pub fn upsert_stage(
    conn: &Connection,
    patient_id: &Uuid,
    data: &StageData,
    now: DateTime<Utc>,
) -> Result<StageRecord, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    let pid = patient_id.to_string();
    let ts = format_timestamp(&now);

    match data {
        StageData::Assessment(d) => conn.execute(
            "INSERT INTO stage_assessment (id, patient_id, evaluation_date, diagnosis, severity,
             procedure_requested, requester, opme_needed, special_opme, previous_complications,
             completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(patient_id) DO UPDATE SET
                evaluation_date = excluded.evaluation_date,
                diagnosis = excluded.diagnosis,
                severity = excluded.severity,
                procedure_requested = excluded.procedure_requested,
                requester = excluded.requester,
                opme_needed = excluded.opme_needed,
                special_opme = excluded.special_opme,
                previous_complications = excluded.previous_complications,
                updated_at = excluded.updated_at",
            params![
                id,
                pid,
                format_date(&d.evaluation_date),
                d.diagnosis,
                d.severity,
                d.procedure_requested,
                d.requester,
                d.opme_needed,
                d.special_opme,
                d.previous_complications,
                ts,
            ],
        )?,
        StageData::Authorization(d) => conn.execute(
            "INSERT INTO stage_authorization (id, patient_id, opme_authorized, scheduling_date,
             execution_date, execution_time, cancellation_reason, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(patient_id) DO UPDATE SET
                opme_authorized = excluded.opme_authorized,
                scheduling_date = excluded.scheduling_date,
                execution_date = excluded.execution_date,
                execution_time = excluded.execution_time,
                cancellation_reason = excluded.cancellation_reason,
                updated_at = excluded.updated_at",
            params![
                id,
                pid,
                d.opme_authorized,
                d.scheduling_date.as_ref().map(format_date),
                d.execution_date.as_ref().map(format_date),
                d.execution_time.as_ref().map(format_time),
                d.cancellation_reason,
                ts,
            ],
        )?,
        StageData::ProcedureExecution(d) => conn.execute(
            "INSERT INTO stage_procedure_execution (id, patient_id, execution_date, medical_report,
             patient_informed, previous_complications, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(patient_id) DO UPDATE SET
                execution_date = excluded.execution_date,
                medical_report = excluded.medical_report,
                patient_informed = excluded.patient_informed,
                previous_complications = excluded.previous_complications,
                updated_at = excluded.updated_at",
            params![
                id,
                pid,
                format_date(&d.execution_date),
                d.medical_report,
                d.patient_informed,
                d.previous_complications,
                ts,
            ],
        )?,
        StageData::FollowUp(d) => conn.execute(
            "INSERT INTO stage_follow_up (id, patient_id, post_procedure_complications,
             completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(patient_id) DO UPDATE SET
                post_procedure_complications = excluded.post_procedure_complications,
                updated_at = excluded.updated_at",
            params![id, pid, d.post_procedure_complications, ts],
        )?,
    };

    get_stage(conn, patient_id, data.kind())?.ok_or_else(|| {
        DatabaseError::ConstraintViolation(format!(
            "{} record for patient {patient_id} missing after upsert",
            data.kind()
        ))
    })
}

pub fn get_stage(
    conn: &Connection,
    patient_id: &Uuid,
    kind: StageKind,
) -> Result<Option<StageRecord>, DatabaseError> {
    let pid = patient_id.to_string();
    let row = match kind {
        StageKind::Assessment => conn
            .query_row(
                "SELECT id, patient_id, completed_at, updated_at, evaluation_date, diagnosis,
                 severity, procedure_requested, requester, opme_needed, special_opme,
                 previous_complications
                 FROM stage_assessment WHERE patient_id = ?1",
                params![pid],
                |row| {
                    Ok((
                        StageRow::read(row)?,
                        AssessmentRow {
                            evaluation_date: row.get(4)?,
                            diagnosis: row.get(5)?,
                            severity: row.get(6)?,
                            procedure_requested: row.get(7)?,
                            requester: row.get(8)?,
                            opme_needed: row.get(9)?,
                            special_opme: row.get(10)?,
                            previous_complications: row.get(11)?,
                        },
                    ))
                },
            )
            .optional()?
            .map(|(base, d)| -> Result<_, DatabaseError> {
                Ok((
                    base,
                    StageData::Assessment(AssessmentData {
                        evaluation_date: parse_date(&d.evaluation_date)?,
                        diagnosis: d.diagnosis,
                        severity: d.severity,
                        procedure_requested: d.procedure_requested,
                        requester: d.requester,
                        opme_needed: d.opme_needed,
                        special_opme: d.special_opme,
                        previous_complications: d.previous_complications,
                    }),
                ))
            })
            .transpose()?,
        StageKind::Authorization => conn
            .query_row(
                "SELECT id, patient_id, completed_at, updated_at, opme_authorized,
                 scheduling_date, execution_date, execution_time, cancellation_reason
                 FROM stage_authorization WHERE patient_id = ?1",
                params![pid],
                |row| {
                    Ok((
                        StageRow::read(row)?,
                        AuthorizationRow {
                            opme_authorized: row.get(4)?,
                            scheduling_date: row.get(5)?,
                            execution_date: row.get(6)?,
                            execution_time: row.get(7)?,
                            cancellation_reason: row.get(8)?,
                        },
                    ))
                },
            )
            .optional()?
            .map(|(base, d)| -> Result<_, DatabaseError> {
                Ok((
                    base,
                    StageData::Authorization(AuthorizationData {
                        opme_authorized: d.opme_authorized,
                        scheduling_date: d.scheduling_date.as_deref().map(parse_date).transpose()?,
                        execution_date: d.execution_date.as_deref().map(parse_date).transpose()?,
                        execution_time: d.execution_time.as_deref().map(parse_time).transpose()?,
                        cancellation_reason: d.cancellation_reason,
                    }),
                ))
            })
            .transpose()?,
        StageKind::ProcedureExecution => conn
            .query_row(
                "SELECT id, patient_id, completed_at, updated_at, execution_date, medical_report,
                 patient_informed, previous_complications
                 FROM stage_procedure_execution WHERE patient_id = ?1",
                params![pid],
                |row| {
                    Ok((
                        StageRow::read(row)?,
                        (
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, bool>(6)?,
                            row.get::<_, bool>(7)?,
                        ),
                    ))
                },
            )
            .optional()?
            .map(|(base, (date, report, informed, complications))| -> Result<_, DatabaseError> {
                Ok((
                    base,
                    StageData::ProcedureExecution(ProcedureExecutionData {
                        execution_date: parse_date(&date)?,
                        medical_report: report,
                        patient_informed: informed,
                        previous_complications: complications,
                    }),
                ))
            })
            .transpose()?,
        StageKind::FollowUp => conn
            .query_row(
                "SELECT id, patient_id, completed_at, updated_at, post_procedure_complications
                 FROM stage_follow_up WHERE patient_id = ?1",
                params![pid],
                |row| Ok((StageRow::read(row)?, row.get::<_, bool>(4)?)),
            )
            .optional()?
            .map(|(base, complications)| {
                (
                    base,
                    StageData::FollowUp(FollowUpData {
                        post_procedure_complications: complications,
                    }),
                )
            }),
    };

    row.map(|(base, data)| base.into_record(data)).transpose()
}

/// Snapshot of every stage record the patient owns.
pub fn get_stages(conn: &Connection, patient_id: &Uuid) -> Result<StageSet, DatabaseError> {
    let mut set = StageSet::new();
    for kind in StageKind::ORDER {
        if let Some(record) = get_stage(conn, patient_id, kind)? {
            set.insert(record);
        }
    }
    Ok(set)
}

/// Kinds present for the patient, without loading payloads.
pub fn get_stage_kinds(
    conn: &Connection,
    patient_id: &Uuid,
) -> Result<Vec<StageKind>, DatabaseError> {
    let pid = patient_id.to_string();
    let mut kinds = Vec::new();
    for kind in StageKind::ORDER {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE patient_id = ?1)", kind.table());
        let present: bool = conn.query_row(&sql, params![pid], |row| row.get(0))?;
        if present {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

/// Remove all four stage records for a patient. Only the patient cascade
/// calls this.
pub(crate) fn delete_stages(conn: &Connection, patient_id: &Uuid) -> Result<usize, DatabaseError> {
    let pid = patient_id.to_string();
    let mut deleted = 0;
    for kind in StageKind::ORDER {
        let sql = format!("DELETE FROM {} WHERE patient_id = ?1", kind.table());
        deleted += conn.execute(&sql, params![pid])?;
    }
    Ok(deleted)
}

/// Stage rows referencing the patient across all four tables.
pub fn count_stage_rows(conn: &Connection, patient_id: &Uuid) -> Result<i64, DatabaseError> {
    let pid = patient_id.to_string();
    let mut total = 0;
    for kind in StageKind::ORDER {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE patient_id = ?1", kind.table());
        total += conn.query_row(&sql, params![pid], |row| row.get::<_, i64>(0))?;
    }
    Ok(total)
}

// Columns shared by every stage table (positions 0..=3).
struct StageRow {
    id: String,
    patient_id: String,
    completed_at: String,
    updated_at: String,
}

impl StageRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            completed_at: row.get(2)?,
            updated_at: row.get(3)?,
        })
    }

    fn into_record(self, data: StageData) -> Result<StageRecord, DatabaseError> {
        Ok(StageRecord {
            id: parse_uuid(&self.id)?,
            patient_id: parse_uuid(&self.patient_id)?,
            data,
            completed_at: parse_timestamp(&self.completed_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct AssessmentRow {
    evaluation_date: String,
    diagnosis: String,
    severity: String,
    procedure_requested: String,
    requester: Option<String>,
    opme_needed: bool,
    special_opme: bool,
    previous_complications: bool,
}

struct AuthorizationRow {
    opme_authorized: bool,
    scheduling_date: Option<String>,
    execution_date: Option<String>,
    execution_time: Option<String>,
    cancellation_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::test_support::*;
    use crate::db::repository::insert_patient;
    use crate::db::sqlite::open_memory_database;

    fn seeded() -> (Connection, Uuid) {
        let conn = open_memory_database().unwrap();
        let patient = PatientRecord::from_intake(intake("12/03/2024 10:15:00", "Maria Silva"));
        insert_patient(&conn, &patient).unwrap();
        (conn, patient.id)
    }

    #[test]
    fn every_stage_kind_round_trips() {
        let (conn, pid) = seeded();
        for kind in StageKind::ORDER {
            let data = stage_data(kind);
            let stored = upsert_stage(&conn, &pid, &data, Utc::now()).unwrap();
            assert_eq!(stored.data, data);
            assert_eq!(stored.patient_id, pid);
        }
        let set = get_stages(&conn, &pid).unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(get_stage_kinds(&conn, &pid).unwrap(), StageKind::ORDER.to_vec());
    }

    #[test]
    fn second_upsert_overwrites_in_place() {
        let (conn, pid) = seeded();
        let first_at = Utc::now() - chrono::Duration::hours(2);
        let first = upsert_stage(&conn, &pid, &authorization(), first_at).unwrap();

        let corrected = StageData::Authorization(AuthorizationData {
            opme_authorized: false,
            scheduling_date: None,
            execution_date: None,
            execution_time: None,
            cancellation_reason: Some("Patient withdrew".into()),
        });
        let second = upsert_stage(&conn, &pid, &corrected, Utc::now()).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.data, corrected);
        assert_eq!(second.completed_at, first.completed_at);
        assert!(second.updated_at > first.updated_at);

        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM stage_authorization WHERE patient_id = ?1",
                params![pid.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn upsert_for_unknown_patient_fails_on_foreign_key() {
        let conn = open_memory_database().unwrap();
        let result = upsert_stage(&conn, &Uuid::new_v4(), &follow_up(), Utc::now());
        assert!(matches!(result, Err(DatabaseError::Sqlite(_))));
    }

    #[test]
    fn delete_stages_clears_all_tables() {
        let (conn, pid) = seeded();
        upsert_stage(&conn, &pid, &assessment(), Utc::now()).unwrap();
        upsert_stage(&conn, &pid, &follow_up(), Utc::now()).unwrap();
        assert_eq!(count_stage_rows(&conn, &pid).unwrap(), 2);

        assert_eq!(delete_stages(&conn, &pid).unwrap(), 2);
        assert_eq!(count_stage_rows(&conn, &pid).unwrap(), 0);
        assert!(get_stages(&conn, &pid).unwrap().is_empty());
    }
}
