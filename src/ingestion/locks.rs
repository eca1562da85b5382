//! Table Locks - One in-process writer per table name

use crate::error::{IngestError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of held table leases, shared by every run in the process.
#[derive(Debug, Default)]
pub struct TableLocks {
    /// table name -> holder (run id)
    held: DashMap<String, String>,
}

impl TableLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the write lease for `table`, or fail with [`IngestError::TableBusy`].
    pub fn try_acquire(self: &Arc<Self>, table: &str, holder: &str) -> Result<TableLease> {
        match self.held.entry(table.to_string()) {
            Entry::Occupied(current) => Err(IngestError::TableBusy {
                table: table.to_string(),
                holder: current.get().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(holder.to_string());
                Ok(TableLease {
                    locks: Arc::clone(self),
                    table: table.to_string(),
                })
            }
        }
    }
}

/// Exclusive write access to one table; released on drop.
#[derive(Debug)]
pub struct TableLease {
    locks: Arc<TableLocks>,
    table: String,
}

impl Drop for TableLease {
    fn drop(&mut self) {
        self.locks.held.remove(&self.table);
    }
}
