use std::collections::BTreeSet;

use rusqlite::Connection;

use crate::db::DatabaseError;
use crate::models::StageKind;
use crate::workflow;

/// A single consistency issue detected by the checker.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsistencyIssue {
    pub category: String,
    pub severity: String,
    pub description: String,
    pub patient_id: Option<String>,
}

/// Result of a consistency check across the store.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsistencyReport {
    pub issues: Vec<ConsistencyIssue>,
    pub patients_checked: i64,
    pub orphaned_stage_rows: i64,
    pub pending_external_deletions: i64,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Run a full, read-only consistency check.
///
/// Detects:
/// - Stage rows whose patient no longer exists
/// - Patients with stages recorded past the first missing one
/// - Deleted patients whose spreadsheet row was never removed
pub fn check_consistency(conn: &Connection) -> Result<ConsistencyReport, DatabaseError> {
    let mut issues = Vec::new();

    // 1. Orphaned stage rows
    let mut orphaned_stage_rows = 0;
    for kind in StageKind::ORDER {
        let sql = format!(
            "SELECT COUNT(*) FROM {} s
             WHERE NOT EXISTS (SELECT 1 FROM patients p WHERE p.id = s.patient_id)",
            kind.table()
        );
        let orphaned: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        if orphaned > 0 {
            issues.push(ConsistencyIssue {
                category: "orphaned_stage".into(),
                severity: "high".into(),
                description: format!("{orphaned} {kind} rows without a patient"),
                patient_id: None,
            });
            orphaned_stage_rows += orphaned;
        }
    }

    // 2. Out-of-order workflows
    let mut stmt = conn.prepare(
        "SELECT p.id,
            EXISTS(SELECT 1 FROM stage_assessment s WHERE s.patient_id = p.id),
            EXISTS(SELECT 1 FROM stage_authorization s WHERE s.patient_id = p.id),
            EXISTS(SELECT 1 FROM stage_procedure_execution s WHERE s.patient_id = p.id),
            EXISTS(SELECT 1 FROM stage_follow_up s WHERE s.patient_id = p.id)
         FROM patients p",
    )?;
    let rows: Vec<(String, [bool; 4])> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                [row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?],
            ))
        })?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    let patients_checked = rows.len() as i64;
    for (id, present) in rows {
        let kinds: BTreeSet<StageKind> = StageKind::ORDER
            .iter()
            .zip(present)
            .filter_map(|(kind, has)| has.then_some(*kind))
            .collect();
        if let Some(anomaly) = workflow::evaluate(&kinds).anomaly {
            issues.push(ConsistencyIssue {
                category: "inconsistent_workflow".into(),
                severity: "medium".into(),
                description: anomaly.to_string(),
                patient_id: Some(id),
            });
        }
    }

    // 3. Spreadsheet rows still present after local deletion
    let pending_external_deletions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM deleted_patients WHERE external_removed = 0",
        [],
        |row| row.get(0),
    )?;
    if pending_external_deletions > 0 {
        issues.push(ConsistencyIssue {
            category: "pending_external_deletion".into(),
            severity: "low".into(),
            description: format!(
                "{pending_external_deletions} deleted patients still present in the source sheet"
            ),
            patient_id: None,
        });
    }

    Ok(ConsistencyReport {
        issues,
        patients_checked,
        orphaned_stage_rows,
        pending_external_deletions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::db::repository::test_support::*;
    use crate::db::repository::{insert_patient, insert_tombstone, upsert_stage};
    use crate::db::sqlite::open_memory_database;
    use crate::models::PatientRecord;

    #[test]
    fn empty_store_is_clean() {
        let conn = open_memory_database().unwrap();
        let report = check_consistency(&conn).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.patients_checked, 0);
    }

    #[test]
    fn out_of_order_stage_is_reported() {
        let conn = open_memory_database().unwrap();
        let ok = PatientRecord::from_intake(intake("1", "In Order"));
        let odd = PatientRecord::from_intake(intake("2", "Out Of Order"));
        insert_patient(&conn, &ok).unwrap();
        insert_patient(&conn, &odd).unwrap();
        upsert_stage(&conn, &ok.id, &assessment(), Utc::now()).unwrap();
        upsert_stage(&conn, &odd.id, &authorization(), Utc::now()).unwrap();

        let report = check_consistency(&conn).unwrap();
        assert_eq!(report.patients_checked, 2);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].category, "inconsistent_workflow");
        assert_eq!(report.issues[0].patient_id, Some(odd.id.to_string()));
    }

    #[test]
    fn orphaned_stage_rows_are_counted() {
        let conn = open_memory_database().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=OFF;").unwrap();
        conn.execute(
            "INSERT INTO stage_follow_up (id, patient_id, post_procedure_complications, completed_at, updated_at)
             VALUES ('s1', 'gone', 0, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let report = check_consistency(&conn).unwrap();
        assert_eq!(report.orphaned_stage_rows, 1);
        assert_eq!(report.issues[0].category, "orphaned_stage");
    }

    #[test]
    fn pending_external_deletion_is_reported() {
        let conn = open_memory_database().unwrap();
        let patient = PatientRecord::from_intake(intake("1", "Deleted"));
        insert_tombstone(&conn, &patient, Utc::now()).unwrap();

        let report = check_consistency(&conn).unwrap();
        assert_eq!(report.pending_external_deletions, 1);
        assert!(report.issues.iter().any(|i| i.category == "pending_external_deletion"));
    }
}
