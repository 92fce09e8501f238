// Store error taxonomy
use std::path::PathBuf;
use thiserror::Error;

use crate::schema::{ColumnKind, SchemaError};

#[derive(Debug, Error)]
pub enum StoreError {
    // Configuration errors, surfaced before any row is accepted
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Store already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Store not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("Chunk size mismatch: store uses {found}, caller expects {expected}")]
    ChunkSizeMismatch { expected: usize, found: usize },

    #[error("Store has no '{0}' column")]
    MissingColumn(String),

    #[error("Column '{column}' mismatch: expected {expected_kind}[{expected_width}], found {found_kind}[{found_width}]")]
    SchemaMismatch {
        column: String,
        expected_kind: ColumnKind,
        expected_width: usize,
        found_kind: ColumnKind,
        found_width: usize,
    },

    #[error("Store has column '{0}' that the schema does not declare")]
    UnexpectedColumn(String),

    #[error("Shuffle of {example_count} examples cannot run {passes} passes")]
    InvalidPasses { passes: usize, example_count: usize },

    // Contract violations
    #[error("Row is missing data for column '{0}'")]
    MissingRowData(String),

    #[error("Row value for column '{column}' has width {found}, expected {expected}")]
    WidthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("Rows {start}..{end} are out of range (example count {example_count})")]
    OutOfRange {
        start: usize,
        end: usize,
        example_count: usize,
    },

    #[error("Store is unusable after an earlier failure")]
    Poisoned,

    // Storage failures
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Configuration errors are raised before a store accepts rows and leave
    /// an open store usable.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StoreError::Schema(_)
                | StoreError::AlreadyExists(_)
                | StoreError::NotFound(_)
                | StoreError::InvalidChunkSize(_)
                | StoreError::ChunkSizeMismatch { .. }
                | StoreError::MissingColumn(_)
                | StoreError::SchemaMismatch { .. }
                | StoreError::UnexpectedColumn(_)
                | StoreError::InvalidPasses { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
