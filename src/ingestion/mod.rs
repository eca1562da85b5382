//! Ingestion Module - Incremental upsert of flat-file batches into the store
//!
//! Per file: read → stage → merge → swap → drop staging. Each file's outcome is
//! an explicit value collected into a [`RunSummary`].

pub mod locks;
pub mod merge;
pub mod orchestrator;
pub mod reader;
pub mod record;
pub mod schema_registry;
pub mod staging;
pub mod swap;

pub use locks::{TableLease, TableLocks};
pub use merge::{MergeEngine, MergeOutput, MergeStats, Origin, RecencyMarker};
pub use orchestrator::IngestionOrchestrator;
pub use reader::{DecodedFile, FileReader};
pub use record::{Column, ColumnType, Relation, Row, Value};
pub use schema_registry::{KeyLookup, KeySpec, SchemaRegistry};
pub use staging::{StagingLoader, StagingRelation, SEQUENCE_COLUMN};
pub use swap::AtomicSwap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of one file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    /// First ingestion for the table
    Created { version: i64, stats: MergeStats },
    /// Merged into an existing table
    Merged { version: i64, stats: MergeStats },
    /// No data rows; live table left as is
    Unchanged,
    Failed { error: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub file: PathBuf,
    pub table: String,
    /// Set when a fallback encoding decoded the file
    pub degraded_encoding: Option<String>,
    pub status: FileStatus,
}

impl FileReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, FileStatus::Failed { .. })
    }
}

/// Everything one dataset run did.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub dataset: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files: Vec<FileReport>,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            dataset: dataset.into(),
            started_at: Utc::now(),
            finished_at: None,
            files: Vec::new(),
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| f.is_failed())
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    /// Staged rows across every file that was swapped in.
    pub fn rows_ingested(&self) -> usize {
        self.files
            .iter()
            .map(|f| match &f.status {
                FileStatus::Created { stats, .. } | FileStatus::Merged { stats, .. } => stats.staged_rows,
                _ => 0,
            })
            .sum()
    }
}
