//! Schema Registry - Primary key definitions per table, with a fallback default

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Primary key definition used for deduplication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Ordered key columns
    pub columns: Vec<String>,

    /// Treat nulls in key columns as equal to each other
    #[serde(default)]
    pub nulls_collide: bool,
}

impl KeySpec {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            nulls_collide: false,
        }
    }

    pub fn with_nulls_collide(mut self, nulls_collide: bool) -> Self {
        self.nulls_collide = nulls_collide;
        self
    }
}

/// Result of a registry lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLookup {
    pub key: KeySpec,
    /// True when no entry matched and the default key was returned
    pub fallback: bool,
}

#[derive(Clone, Debug)]
pub struct SchemaRegistry {
    entries: HashMap<String, KeySpec>,
    default_key: KeySpec,
}

impl SchemaRegistry {
    pub fn new(default_key: KeySpec) -> Self {
        Self {
            entries: HashMap::new(),
            default_key,
        }
    }

    /// Build from per-table key columns plus the set of tables whose nulls collide.
    pub fn from_columns(
        primary_keys: &HashMap<String, Vec<String>>,
        default_key: &[String],
        null_keys_collide: &HashSet<String>,
    ) -> Self {
        let mut registry = Self::new(KeySpec::new(default_key.iter().cloned()));
        for (table, columns) in primary_keys {
            registry.register(
                table.clone(),
                KeySpec::new(columns.iter().cloned())
                    .with_nulls_collide(null_keys_collide.contains(table)),
            );
        }
        registry
    }

    pub fn register(&mut self, table_name: impl Into<String>, key: KeySpec) {
        self.entries.insert(table_name.into(), key);
    }

    /// Key columns for a table, by exact name match, else the default.
    pub fn primary_key_for(&self, table_name: &str) -> KeyLookup {
        match self.entries.get(table_name) {
            Some(key) => KeyLookup {
                key: key.clone(),
                fallback: false,
            },
            None => KeyLookup {
                key: self.default_key.clone(),
                fallback: true,
            },
        }
    }

    pub fn default_key(&self) -> &KeySpec {
        &self.default_key
    }
}
