//! Atomic Swap - Installs a merge result as the live table

use crate::error::Result;
use crate::ingestion::record::Relation;
use crate::store::{next_name, Store};
use tracing::warn;

/// Drops the pending relation unless it was renamed into place.
struct PendingRelation<'a> {
    store: &'a Store,
    name: String,
}

impl Drop for PendingRelation<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.drop_table(&self.name) {
            warn!("Failed to drop pending relation {}: {}", self.name, e);
        }
    }
}

pub struct AtomicSwap<'a> {
    store: &'a Store,
}

impl<'a> AtomicSwap<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Write `relation` under a temporary name, then swap it in for `table`.
    ///
    /// The rename is the last step. A failure before it leaves the live table
    /// untouched. `expected_version` is the catalog version the merge was
    /// computed against. Returns the table's new version.
    pub fn install(
        &self,
        table: &str,
        attempt: &str,
        relation: &Relation,
        expected_version: i64,
        source: Option<&str>,
    ) -> Result<i64> {
        let pending = PendingRelation {
            store: self.store,
            name: next_name(table, attempt),
        };
        self.store.create_table(&pending.name, relation, None)?;
        self.store.swap_in(&pending.name, table, expected_version, source)
    }
}
