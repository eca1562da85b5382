use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ingestion::RunSummary;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Source directory for dataset {dataset} not found: {path}")]
    MissingSourceDirectory { dataset: String, path: PathBuf },

    #[error("No input files found for dataset {dataset} in {path}")]
    NoInputFiles { dataset: String, path: PathBuf },

    #[error("Failed to decode {path} with any of [{tried}]")]
    Decode { path: PathBuf, tried: String },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Row {line} of {path} has {found} cells but the header has {expected}")]
    RaggedRow {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Table {table} is already being ingested by run {holder}")]
    TableBusy { table: String, holder: String },

    #[error("Table {table} changed while merging (expected version {expected}, found {found})")]
    ConcurrentModification {
        table: String,
        expected: i64,
        found: i64,
    },

    #[error("Dataset {dataset}: {failed} of {attempted} file(s) failed")]
    DatasetFailed {
        dataset: String,
        failed: usize,
        attempted: usize,
        summary: Box<RunSummary>,
    },

    #[error("Dataset {dataset} timed out after {after:?}")]
    Timeout { dataset: String, after: Duration },

    #[error("Ingestion of dataset {dataset} was cancelled")]
    Cancelled { dataset: String },

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl IngestError {
    /// Whether a scheduler should try the whole dataset again on its next attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, IngestError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
