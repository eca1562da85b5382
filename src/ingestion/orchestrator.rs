//! Ingestion Orchestrator - Drives every file of a dataset through stage, merge and swap

use crate::config::{Config, DatasetConfig};
use crate::error::{IngestError, Result};
use crate::ingestion::{
    AtomicSwap, FileReader, FileReport, FileStatus, MergeEngine, RunSummary, SchemaRegistry,
    StagingLoader, TableLease, TableLocks,
};
use crate::store::{new_attempt_id, Store};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

/// Sole writer of the dataset tables.
pub struct IngestionOrchestrator {
    store: Arc<Store>,
    locks: Arc<TableLocks>,
    default_encodings: Vec<String>,
}

impl IngestionOrchestrator {
    pub fn new(store: Arc<Store>, locks: Arc<TableLocks>, default_encodings: Vec<String>) -> Self {
        Self {
            store,
            locks,
            default_encodings,
        }
    }

    /// Open the configured store and wire a fresh lock registry.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Store::open(&config.store_path, config.busy_timeout())?;
        Ok(Self::new(
            Arc::new(store),
            TableLocks::new(),
            config.encodings.clone(),
        ))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Ingest every input file of `dataset`, in file-name order.
    ///
    /// A failing file is recorded and the remaining files still run. The run
    /// fails with [`IngestError::DatasetFailed`] if any file failed, with
    /// [`IngestError::NoInputFiles`] if files were expected but none were found,
    /// and with [`IngestError::MissingSourceDirectory`] before touching anything.
    pub fn run(&self, dataset: &DatasetConfig) -> Result<RunSummary> {
        self.run_cancellable(dataset, &CancellationToken::new())
    }

    /// Like [`run`](Self::run), but stops with [`IngestError::Cancelled`] once
    /// `cancel` fires. The token is checked before each file and right before
    /// each swap, so the file in flight is never swapped in after cancellation.
    pub fn run_cancellable(
        &self,
        dataset: &DatasetConfig,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("dataset", name = %dataset.name, run_id = %run_id);
        let _enter = span.enter();

        let mut summary = RunSummary::new(&run_id, &dataset.name);

        let files = self.discover(dataset)?;
        info!(
            "Found {} input file(s) in {}",
            files.len(),
            dataset.source_dir.display()
        );
        if files.is_empty() {
            if dataset.expect_files {
                return Err(IngestError::NoInputFiles {
                    dataset: dataset.name.clone(),
                    path: dataset.source_dir.clone(),
                });
            }
            summary.finished_at = Some(Utc::now());
            return Ok(summary);
        }

        let encodings = dataset.encodings.as_deref().unwrap_or(&self.default_encodings);
        let mut run = RunContext {
            dataset,
            run_id: &run_id,
            cancel,
            reader: FileReader::new(encodings)?,
            registry: dataset.schema_registry(),
            leases: HashMap::new(),
        };

        for path in files {
            run.ensure_active()?;
            let mut report = FileReport {
                table: dataset.table_name_for(&path),
                file: path,
                degraded_encoding: None,
                status: FileStatus::Unchanged,
            };

            match self.ingest_file(&mut run, &mut report) {
                Ok(status) => report.status = status,
                Err(e @ IngestError::Cancelled { .. }) => {
                    warn!(
                        "Cancelled before swapping {} into {}",
                        report.file.display(),
                        report.table
                    );
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        "Failed to ingest {} into {} (dataset {}): {}",
                        report.file.display(),
                        report.table,
                        dataset.name,
                        e
                    );
                    report.status = FileStatus::Failed {
                        error: e.to_string(),
                    };
                }
            }
            summary.files.push(report);
        }
        summary.finished_at = Some(Utc::now());

        let failed = summary.failed_count();
        if failed > 0 {
            return Err(IngestError::DatasetFailed {
                dataset: dataset.name.clone(),
                failed,
                attempted: summary.files.len(),
                summary: Box::new(summary),
            });
        }

        info!(
            "Dataset {} ingestion complete: {} file(s), {} row(s)",
            dataset.name,
            summary.files.len(),
            summary.rows_ingested()
        );
        Ok(summary)
    }

    /// Candidate files sorted by file name.
    fn discover(&self, dataset: &DatasetConfig) -> Result<Vec<PathBuf>> {
        if !dataset.source_dir.is_dir() {
            return Err(IngestError::MissingSourceDirectory {
                dataset: dataset.name.clone(),
                path: dataset.source_dir.clone(),
            });
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dataset.source_dir)? {
            let path = entry?.path();
            if path.is_file() && dataset.accepts(&path) {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    fn ingest_file(&self, run: &mut RunContext<'_>, report: &mut FileReport) -> Result<FileStatus> {
        let table = report.table.clone();
        let span = info_span!("file", path = %report.file.display(), table = %table);
        let _enter = span.enter();
        info!("Ingesting {}...", report.file.display());

        let decoded = run.reader.read(&report.file)?;
        if decoded.degraded {
            report.degraded_encoding = Some(decoded.encoding.to_string());
        }

        if !run.leases.contains_key(&table) {
            let lease = self.locks.try_acquire(&table, run.run_id)?;
            run.leases.insert(table.clone(), lease);
        }

        let attempt = new_attempt_id();
        let staging = StagingLoader::new(&self.store).load(&table, &attempt, &decoded.relation)?;
        let snapshot = self.store.snapshot(&table)?;

        if staging.is_empty() && snapshot.relation.is_some() {
            info!("{} has no data rows; table {} unchanged", report.file.display(), table);
            return Ok(FileStatus::Unchanged);
        }

        let staged = staging.read()?;
        if staged.columns.is_empty() && snapshot.relation.is_none() {
            info!("{} is empty; table {} not created", report.file.display(), table);
            return Ok(FileStatus::Unchanged);
        }

        let lookup = run.registry.primary_key_for(&table);
        if lookup.fallback {
            warn!(
                "No primary key registered for {}; falling back to {:?}",
                table, lookup.key.columns
            );
        }

        let output = MergeEngine::merge(snapshot.relation.as_ref(), &staged, &lookup.key);
        if !output.missing_key_columns.is_empty() {
            warn!(
                "Key column(s) {:?} missing from {}; rows with a missing key are only deduplicated when identical",
                output.missing_key_columns, table
            );
        }

        run.ensure_active()?;

        let source = source_label(&report.file);
        let version = AtomicSwap::new(&self.store).install(
            &table,
            &attempt,
            &output.relation,
            snapshot.version,
            Some(&source),
        )?;
        drop(staging);

        let stats = output.stats;
        if snapshot.relation.is_some() {
            info!(
                "Table {} updated to version {}: {} staged, {} replaced, {} row(s) total",
                table, version, stats.staged_rows, stats.replaced, stats.output_rows
            );
            Ok(FileStatus::Merged { version, stats })
        } else {
            info!("Table {} created with {} row(s)", table, stats.output_rows);
            Ok(FileStatus::Created { version, stats })
        }
    }
}

/// State shared by every file of one run. Leases are held until the run ends.
struct RunContext<'a> {
    dataset: &'a DatasetConfig,
    run_id: &'a str,
    cancel: &'a CancellationToken,
    reader: FileReader,
    registry: SchemaRegistry,
    leases: HashMap<String, TableLease>,
}

impl RunContext<'_> {
    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled {
                dataset: self.dataset.name.clone(),
            });
        }
        Ok(())
    }
}

fn source_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
