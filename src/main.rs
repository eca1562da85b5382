use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use minilake::{run_datasets, Config, IngestionOrchestrator, RetryPolicy, Store};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "minilake")]
#[command(about = "Incremental upsert ingestion of flat files into a local analytical store")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config/minilake.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest configured datasets
    Ingest {
        /// Only ingest these datasets (default: all)
        #[arg(short, long)]
        dataset: Vec<String>,

        /// Override the configured retry count
        #[arg(long)]
        retries: Option<u32>,

        /// Override the configured delay between retries
        #[arg(long)]
        retry_delay_secs: Option<u64>,

        /// Override the configured per-attempt timeout
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// List live tables with row counts and versions
    Tables,
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = match args.command {
        Command::Ingest {
            dataset,
            retries,
            retry_delay_secs,
            timeout_secs,
        } => ingest(&args.config, &dataset, retries, retry_delay_secs, timeout_secs),
        Command::Tables => tables(&args.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn ingest(
    config_path: &Path,
    only: &[String],
    retries: Option<u32>,
    retry_delay_secs: Option<u64>,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let mut policy = RetryPolicy::from(&config.schedule);
    if let Some(retries) = retries {
        policy.retries = retries;
    }
    if let Some(secs) = retry_delay_secs {
        policy.retry_delay = Duration::from_secs(secs);
    }
    if let Some(secs) = timeout_secs {
        policy.timeout = Duration::from_secs(secs);
    }

    let mut datasets = Vec::new();
    for dataset in &config.datasets {
        if only.is_empty() || only.contains(&dataset.name) {
            datasets.push(dataset.clone());
        }
    }
    for name in only {
        if config.dataset(name).is_none() {
            bail!("Unknown dataset: {}", name);
        }
    }

    info!(
        "Ingesting {} dataset(s) into {}",
        datasets.len(),
        config.store_path.display()
    );
    let orchestrator = Arc::new(IngestionOrchestrator::from_config(&config)?);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let outcomes = runtime.block_on(run_datasets(orchestrator, datasets, policy));

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(summary) => info!(
                "{}: {} file(s), {} row(s) ingested after {} attempt(s)",
                outcome.dataset,
                summary.files.len(),
                summary.rows_ingested(),
                outcome.attempts
            ),
            Err(e) => {
                failed += 1;
                error!(
                    "{}: failed after {} attempt(s): {}",
                    outcome.dataset, outcome.attempts, e
                );
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} dataset(s) failed", failed, outcomes.len());
    }
    Ok(())
}

fn tables(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let store = Store::open(&config.store_path, config.busy_timeout())?;

    println!("\n=== Tables in {} ===", config.store_path.display());
    for table in store.list_tables()? {
        let rows = store.row_count(&table)?;
        match store.catalog_entry(&table)? {
            Some(entry) => println!(
                "{:<40} {:>10} rows  v{:<5} {}",
                table,
                rows,
                entry.version,
                entry.updated_at
            ),
            None => println!("{:<40} {:>10} rows", table, rows),
        }
    }
    Ok(())
}
