//! Staging Loader - Materializes one file's rows as an ephemeral relation in the store

use crate::error::Result;
use crate::ingestion::record::Relation;
use crate::store::{staging_name, Store};
use tracing::{debug, warn};

/// Explicit per-row recency within one staged file.
pub const SEQUENCE_COLUMN: &str = "__ingest_seq";

/// A staged batch owned by exactly one ingestion attempt.
///
/// The backing relation is dropped when this value goes out of scope, whether
/// the attempt succeeded, failed, or panicked.
pub struct StagingRelation<'a> {
    store: &'a Store,
    name: String,
    rows: usize,
}

impl<'a> StagingRelation<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Rows in file order.
    pub fn read(&self) -> Result<Relation> {
        self.store.read_sequenced(&self.name, SEQUENCE_COLUMN)
    }
}

impl Drop for StagingRelation<'_> {
    fn drop(&mut self) {
        match self.store.drop_table(&self.name) {
            Ok(()) => debug!("Dropped staging relation {}", self.name),
            Err(e) => warn!("Failed to drop staging relation {}: {}", self.name, e),
        }
    }
}

pub struct StagingLoader<'a> {
    store: &'a Store,
}

impl<'a> StagingLoader<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Stage `relation` for `table` under a name unique to `attempt`.
    pub fn load(&self, table: &str, attempt: &str, relation: &Relation) -> Result<StagingRelation<'a>> {
        let name = staging_name(table, attempt);
        self.store.create_table(&name, relation, Some(SEQUENCE_COLUMN))?;
        debug!("Staged {} row(s) into {}", relation.len(), name);
        Ok(StagingRelation {
            store: self.store,
            name,
            rows: relation.len(),
        })
    }
}
