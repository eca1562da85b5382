pub mod config;
pub mod error;
pub mod ingestion;
pub mod scheduler;
pub mod store;

pub use config::{Config, DatasetConfig, ScheduleConfig};
pub use error::{IngestError, Result};
pub use ingestion::{FileReport, FileStatus, IngestionOrchestrator, RunSummary};
pub use scheduler::{run_dataset, run_datasets, DatasetOutcome, RetryPolicy};
pub use store::Store;
