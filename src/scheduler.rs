//! Scheduler shim - Runs datasets concurrently with retry and timeout policy
//!
//! Each attempt runs the synchronous orchestrator on the blocking pool with its
//! own cancellation token. When the timeout fires the token is cancelled and the
//! attempt is awaited until it stops, so nothing it had in flight is swapped in
//! afterwards and a retry never overlaps it.

use crate::config::{DatasetConfig, ScheduleConfig};
use crate::error::{IngestError, Result};
use crate::ingestion::{IngestionOrchestrator, RunSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure
    pub retries: u32,
    pub retry_delay: Duration,
    /// Hard limit per attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ScheduleConfig::default())
    }
}

impl From<&ScheduleConfig> for RetryPolicy {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            retries: config.retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[derive(Debug)]
pub struct DatasetOutcome {
    pub dataset: String,
    pub attempts: u32,
    pub result: Result<RunSummary>,
}

impl DatasetOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run one dataset until it succeeds or the policy gives up.
pub async fn run_dataset(
    orchestrator: Arc<IngestionOrchestrator>,
    dataset: DatasetConfig,
    policy: RetryPolicy,
) -> DatasetOutcome {
    let mut attempts = 0;
    loop {
        attempts += 1;
        info!("Starting {} ingestion (attempt {})", dataset.name, attempts);

        let cancel = CancellationToken::new();
        let orch = Arc::clone(&orchestrator);
        let ds = dataset.clone();
        let token = cancel.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || orch.run_cancellable(&ds, &token));

        let result = match tokio::time::timeout(policy.timeout, &mut handle).await {
            Ok(joined) => joined.map_err(IngestError::from).and_then(|r| r),
            Err(_) => {
                cancel.cancel();
                // the attempt stops at its next checkpoint; wait so it cannot swap later
                match handle.await {
                    Ok(Ok(summary)) => {
                        warn!("{} completed as its timeout fired", dataset.name);
                        Ok(summary)
                    }
                    _ => Err(IngestError::Timeout {
                        dataset: dataset.name.clone(),
                        after: policy.timeout,
                    }),
                }
            }
        };

        match result {
            Ok(summary) => {
                info!("{} ingestion completed successfully", dataset.name);
                return DatasetOutcome {
                    dataset: dataset.name,
                    attempts,
                    result: Ok(summary),
                };
            }
            Err(e) if attempts <= policy.retries && e.is_retryable() => {
                warn!(
                    "Error in {} ingestion: {}; retrying in {:?}",
                    dataset.name, e, policy.retry_delay
                );
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(e) => {
                error!("Error in {} ingestion: {}", dataset.name, e);
                return DatasetOutcome {
                    dataset: dataset.name,
                    attempts,
                    result: Err(e),
                };
            }
        }
    }
}

/// Run independent datasets concurrently; outcomes keep the input order.
pub async fn run_datasets(
    orchestrator: Arc<IngestionOrchestrator>,
    datasets: Vec<DatasetConfig>,
    policy: RetryPolicy,
) -> Vec<DatasetOutcome> {
    let handles: Vec<_> = datasets
        .into_iter()
        .map(|dataset| {
            let name = dataset.name.clone();
            let task = tokio::spawn(run_dataset(Arc::clone(&orchestrator), dataset, policy));
            (name, task)
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for (name, task) in handles {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => DatasetOutcome {
                dataset: name,
                attempts: 0,
                result: Err(IngestError::TaskJoin(e)),
            },
        };
        outcomes.push(outcome);
    }
    outcomes
}
