//! Configuration - Static store and dataset definitions loaded from JSON

use crate::error::{IngestError, Result};
use crate::ingestion::schema_registry::SchemaRegistry;
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `store_path`.
pub const STORE_ENV: &str = "MINILAKE_STORE";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database file holding the live tables
    pub store_path: PathBuf,

    /// Encodings tried in order when decoding input files
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,

    /// How long a writer waits on another process's lock before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    pub datasets: Vec<DatasetConfig>,
}

/// Retry and timeout policy applied by the scheduler shim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,

    /// Directory scanned for input files
    pub source_dir: PathBuf,

    /// Prepended to every table name of this dataset
    #[serde(default)]
    pub table_prefix: String,

    /// File extensions picked up from `source_dir`, without the dot
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Merge every file into this one table instead of one table per file stem
    #[serde(default)]
    pub table: Option<String>,

    /// Primary key columns per table name (prefix included)
    #[serde(default)]
    pub primary_keys: HashMap<String, Vec<String>>,

    /// Key used for tables without an entry in `primary_keys`
    #[serde(default)]
    pub default_key: Vec<String>,

    /// Tables whose key columns treat null as a matchable value
    #[serde(default)]
    pub null_keys_collide: HashSet<String>,

    /// Overrides the store-wide encoding list
    #[serde(default)]
    pub encodings: Option<Vec<String>>,

    /// Fail the run when the directory holds no input files
    #[serde(default = "default_true")]
    pub expect_files: bool,
}

fn default_encodings() -> Vec<String> {
    vec!["utf-8".to_string(), "latin1".to_string()]
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_retries() -> u32 {
    2
}

fn default_retry_delay_secs() -> u64 {
    300
}

fn default_timeout_secs() -> u64 {
    1_800
}

fn default_extensions() -> Vec<String> {
    vec!["csv".to_string()]
}

fn default_true() -> bool {
    true
}

impl DatasetConfig {
    pub fn new(name: impl Into<String>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_dir: source_dir.into(),
            table_prefix: String::new(),
            extensions: default_extensions(),
            table: None,
            primary_keys: HashMap::new(),
            default_key: Vec::new(),
            null_keys_collide: HashSet::new(),
            encodings: None,
            expect_files: true,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_key<S: Into<String>>(mut self, table: impl Into<String>, columns: impl IntoIterator<Item = S>) -> Self {
        self.primary_keys
            .insert(table.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_default_key<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.default_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Live table receiving `file`.
    pub fn table_name_for(&self, file: &Path) -> String {
        match &self.table {
            Some(table) => format!("{}{}", self.table_prefix, table),
            None => {
                let stem = file
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                format!("{}{}", self.table_prefix, stem)
            }
        }
    }

    pub fn accepts(&self, file: &Path) -> bool {
        file.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy();
                self.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
            })
            .unwrap_or(false)
    }

    pub fn schema_registry(&self) -> SchemaRegistry {
        SchemaRegistry::from_columns(&self.primary_keys, &self.default_key, &self.null_keys_collide)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(IngestError::Config("Dataset name must not be empty".to_string()));
        }
        if self.extensions.is_empty() {
            return Err(IngestError::Config(format!(
                "Dataset {} lists no file extensions",
                self.name
            )));
        }
        if let Some(encodings) = &self.encodings {
            validate_encodings(&self.name, encodings)?;
        }
        Ok(())
    }
}

impl Config {
    /// Load from a JSON file. Relative paths resolve against the file's directory;
    /// `MINILAKE_STORE` overrides the store path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| IngestError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut config = Self::from_json_str(&content, base_dir)?;

        if let Ok(store) = std::env::var(STORE_ENV) {
            if !store.trim().is_empty() {
                config.store_path = PathBuf::from(store);
            }
        }

        Ok(config)
    }

    pub fn from_json_str(content: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Config = serde_json::from_str(content)?;
        config.store_path = resolve(base_dir, &config.store_path);
        for dataset in &mut config.datasets {
            dataset.source_dir = resolve(base_dir, &dataset.source_dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.datasets.is_empty() {
            return Err(IngestError::Config("No datasets configured".to_string()));
        }
        validate_encodings("store", &self.encodings)?;

        let mut names = HashSet::new();
        for dataset in &self.datasets {
            dataset.validate()?;
            if !names.insert(dataset.name.as_str()) {
                return Err(IngestError::Config(format!(
                    "Duplicate dataset name: {}",
                    dataset.name
                )));
            }
        }
        Ok(())
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn validate_encodings(owner: &str, encodings: &[String]) -> Result<()> {
    if encodings.is_empty() {
        return Err(IngestError::Config(format!("{} lists no encodings", owner)));
    }
    for label in encodings {
        if Encoding::for_label(label.trim().as_bytes()).is_none() {
            return Err(IngestError::Config(format!(
                "{}: unknown encoding label {}",
                owner, label
            )));
        }
    }
    Ok(())
}
