pub mod config;
pub mod db;
pub mod deletion;
pub mod gateway;
pub mod intake;
pub mod models;
pub mod reconcile;
pub mod service;
pub mod workflow;

use tracing_subscriber::EnvFilter;

use crate::db::PatientStore;
use crate::gateway::{ExternalSource, OfflineSource, SheetsSource};
use crate::service::{PatientService, ServiceError};

pub fn run() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    if let Err(e) = start() {
        tracing::error!(error = %e, kind = e.kind().code(), "Startup failed");
        std::process::exit(1);
    }
}

fn start() -> Result<(), ServiceError> {
    let db_path = config::database_path();
    let store = PatientStore::open(&db_path)?;
    tracing::info!(path = %db_path.display(), "Patient store ready");

    let (source, online): (Box<dyn ExternalSource>, bool) = match config::SourceConfig::from_env() {
        Some(source_config) => (Box::new(SheetsSource::new(source_config)?), true),
        None => {
            tracing::info!("No spreadsheet configured, running offline");
            (Box::new(OfflineSource), false)
        }
    };
    let service = PatientService::new(store, source);

    if online {
        match service.sync() {
            Ok(summary) if summary.has_failures() => {
                for failure in &summary.failures {
                    tracing::warn!(
                        position = failure.position,
                        reason = %failure.reason,
                        "Row not imported"
                    );
                }
            }
            Ok(_) => {}
            // Already-imported patients stay usable
            Err(e) => tracing::warn!(error = %e, "Initial sync failed"),
        }
    }

    let patients = service.search_patients("")?;
    let in_progress = patients.iter().filter(|p| !p.workflow.is_complete()).count();
    let pending = service.pending_external_deletions()?;
    tracing::info!(
        patients = patients.len(),
        in_progress,
        pending_deletions = pending.len(),
        "Store summary"
    );

    let report = service.check_consistency()?;
    for issue in &report.issues {
        tracing::warn!(
            category = %issue.category,
            patient_id = issue.patient_id.as_deref().unwrap_or("-"),
            "{}",
            issue.description
        );
    }
    Ok(())
}
