use std::sync::Mutex;

use super::{DeleteOutcome, ExternalSource, GatewayError, RawRow};
use crate::models::NaturalKey;

/// In-memory source for unit testing.
///
/// Rows can be replaced between calls to mimic other people editing the
/// sheet; failures can be switched on per capability. Every delete call is
/// recorded, successful or not.
#[derive(Default)]
pub struct MockSource {
    rows: Mutex<Vec<Vec<String>>>,
    list_failure: Mutex<Option<GatewayError>>,
    delete_failure: Mutex<Option<GatewayError>>,
    delete_calls: Mutex<Vec<NaturalKey>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        let source = Self::new();
        source.set_rows(rows);
        source
    }

    pub fn set_rows(&self, rows: Vec<Vec<String>>) {
        if let Ok(mut current) = self.rows.lock() {
            *current = rows;
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn fail_listing(&self, error: Option<GatewayError>) {
        if let Ok(mut slot) = self.list_failure.lock() {
            *slot = error;
        }
    }

    pub fn fail_deletes(&self, error: Option<GatewayError>) {
        if let Ok(mut slot) = self.delete_failure.lock() {
            *slot = error;
        }
    }

    pub fn delete_calls(&self) -> Vec<NaturalKey> {
        self.delete_calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn lock_err() -> GatewayError {
        GatewayError::SourceUnavailable("mock source lock poisoned".into())
    }
}

impl ExternalSource for MockSource {
    fn list_rows(&self) -> Result<Vec<RawRow>, GatewayError> {
        if let Some(err) = self.list_failure.lock().map_err(|_| Self::lock_err())?.clone() {
            return Err(err);
        }
        let rows = self.rows.lock().map_err(|_| Self::lock_err())?;
        Ok(rows
            .iter()
            .enumerate()
            .map(|(position, cells)| RawRow::new(position, cells.clone()))
            .collect())
    }

    fn delete_row(&self, key: &NaturalKey) -> Result<DeleteOutcome, GatewayError> {
        self.delete_calls
            .lock()
            .map_err(|_| Self::lock_err())?
            .push(key.clone());

        if let Some(err) = self.delete_failure.lock().map_err(|_| Self::lock_err())?.clone() {
            return Err(err);
        }

        let mut rows = self.rows.lock().map_err(|_| Self::lock_err())?;
        let index = rows.iter().enumerate().position(|(position, cells)| {
            RawRow::new(position, cells.clone()).natural_key().as_ref() == Some(key)
        });
        match index {
            Some(i) => {
                rows.remove(i);
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }
}
