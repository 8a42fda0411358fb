//! Boundary to the spreadsheet that receives intake form responses.
//!
//! Two capabilities only: list the current rows, delete a row by natural
//! key. The sheet is shared and edited by others with no locking from our
//! side, so every call sees a fresh snapshot and nothing is cached here.

pub mod mock;
pub mod sheets;

use thiserror::Error;

use crate::models::NaturalKey;

pub use crate::intake::RawRow;
pub use mock::MockSource;
pub use sheets::SheetsSource;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("External source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("External source timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Unexpected response from external source: {0}")]
    MalformedResponse(String),
}

/// Result of a delete against the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// No row carries the key. Someone else may already have removed it.
    NotFound,
}

pub trait ExternalSource: Send + Sync {
    /// Current response rows in source order.
    fn list_rows(&self) -> Result<Vec<RawRow>, GatewayError>;

    /// Remove the first row whose natural key matches.
    fn delete_row(&self, key: &NaturalKey) -> Result<DeleteOutcome, GatewayError>;
}

impl<T: ExternalSource + ?Sized> ExternalSource for Box<T> {
    fn list_rows(&self) -> Result<Vec<RawRow>, GatewayError> {
        (**self).list_rows()
    }

    fn delete_row(&self, key: &NaturalKey) -> Result<DeleteOutcome, GatewayError> {
        (**self).delete_row(key)
    }
}

/// Stand-in when no spreadsheet is configured. Every call reports the
/// source as unavailable, so deletions stay flagged as pending.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineSource;

impl ExternalSource for OfflineSource {
    fn list_rows(&self) -> Result<Vec<RawRow>, GatewayError> {
        Err(GatewayError::SourceUnavailable("no external source configured".into()))
    }

    fn delete_row(&self, _key: &NaturalKey) -> Result<DeleteOutcome, GatewayError> {
        Err(GatewayError::SourceUnavailable("no external source configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_source_refuses_everything() {
        let source: Box<dyn ExternalSource> = Box::new(OfflineSource);
        assert!(source.list_rows().is_err());
        assert!(source.delete_row(&NaturalKey::derive("1", "A")).is_err());
    }
}
