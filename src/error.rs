use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while ingesting a single info file.
///
/// Everything except a lost storage connection is scoped to the file being processed:
/// the orchestrator logs it, rolls the file back and moves on.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Filesystem error at {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported layout in {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Mapping for table '{table}' did not produce columns: {missing:?}")]
    Mapping { table: String, missing: Vec<String> },

    #[error("Malformed value in field '{field}' (record {record:?}): {reason}")]
    MalformedValue {
        field: String,
        record: Option<usize>,
        reason: String,
    },

    #[error("Record {record} has no usable asset path in field '{field}'")]
    MissingAssetPath { field: String, record: usize },

    #[error("Asset id {id} claimed by '{existing}' and '{incoming}' (record {record})")]
    IdentityConflict {
        id: Uuid,
        existing: String,
        incoming: String,
        record: usize,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl IngestError {
    /// Whether the error means the storage connection itself is gone, which aborts the run.
    pub fn is_fatal(&self) -> bool {
        match self {
            IngestError::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
            ),
            _ => false,
        }
    }

    /// Source record index, when the error can be pinned to one.
    pub fn record_index(&self) -> Option<usize> {
        match self {
            IngestError::MalformedValue { record, .. } => *record,
            IngestError::MissingAssetPath { record, .. }
            | IngestError::IdentityConflict { record, .. } => Some(*record),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
