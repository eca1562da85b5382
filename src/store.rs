//! Store - Embedded SQLite database holding the live dataset tables
//!
//! Architecture: one connection behind a mutex. Every compound operation
//! (bulk load, snapshot read, swap) holds the guard for its whole duration so
//! statements issued for different datasets never share a transaction.
//!
//! A bookkeeping table, [`CATALOG_TABLE`], carries a version per live table. The
//! swap compares it against the version seen when the merge read the table, so a
//! writer in another process can never be silently overwritten.

use crate::error::{IngestError, Result};
use crate::ingestion::record::{Column, ColumnType, Relation, Value};
use chrono::Utc;
use itertools::Itertools;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub const CATALOG_TABLE: &str = "_minilake_catalog";

const STAGING_MARKER: &str = "__staging_";
const NEXT_MARKER: &str = "__next_";

/// Name of the per-attempt staging relation for `table`.
pub fn staging_name(table: &str, attempt: &str) -> String {
    format!("{}{}{}", table, STAGING_MARKER, attempt)
}

/// Name of the per-attempt merge result awaiting swap for `table`.
pub fn next_name(table: &str, attempt: &str) -> String {
    format!("{}{}{}", table, NEXT_MARKER, attempt)
}

/// Fresh attempt id: 32 lowercase hex digits.
pub fn new_attempt_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Staging and pending-swap relations are never listed to readers.
///
/// Only names ending in a marker followed by an attempt id qualify, so a live
/// table that merely contains a marker stays visible.
pub fn is_transient(name: &str) -> bool {
    [STAGING_MARKER, NEXT_MARKER].iter().any(|marker| {
        name.rsplit_once(marker).is_some_and(|(table, attempt)| {
            !table.is_empty()
                && attempt.len() == 32
                && attempt.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
    })
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Catalog bookkeeping for one live table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub table_name: String,
    pub version: i64,
    pub row_count: i64,
    pub last_source: Option<String>,
    pub updated_at: String,
}

/// A consistent read of a live table and its catalog version.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    /// None when the table does not exist yet
    pub relation: Option<Relation>,
    pub version: i64,
}

pub struct Store {
    path: Option<PathBuf>,
    db: Mutex<Connection>,
}

impl Store {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Connection::open(&path)?;
        db.busy_timeout(busy_timeout)?;
        // WAL lets readers keep querying while a swap commits
        let mode: String =
            db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Store journal mode: {}", mode);

        let store = Self {
            path: Some(path),
            db: Mutex::new(db),
        };
        store.init_schema()?;
        info!("Opened store at {}", store.describe());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            path: None,
            db: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn describe(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock_conn();
        db.execute(
            &format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    table_name TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    row_count INTEGER NOT NULL,
                    last_source TEXT,
                    updated_at TEXT NOT NULL
                )
                "#,
                quote_ident(CATALOG_TABLE)
            ),
            [],
        )?;
        Ok(())
    }

    /// A poisoned guard still wraps a usable connection; SQLite rolls back
    /// any transaction the panicking holder left open.
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let db = self.lock_conn();
        table_exists_in(&db, name)
    }

    /// Live dataset tables, sorted by name.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let db = self.lock_conn();
        let mut stmt = db.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names
            .into_iter()
            .filter(|n| n != CATALOG_TABLE && !is_transient(n))
            .collect())
    }

    pub fn table_columns(&self, name: &str) -> Result<Vec<Column>> {
        let db = self.lock_conn();
        columns_of(&db, name)
    }

    pub fn row_count(&self, name: &str) -> Result<i64> {
        let db = self.lock_conn();
        let count = db.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Whole-table read, rows in insertion order. None if the table is absent.
    pub fn read_table(&self, name: &str) -> Result<Option<Relation>> {
        let db = self.lock_conn();
        if !table_exists_in(&db, name)? {
            return Ok(None);
        }
        read_relation(&db, name, None).map(Some)
    }

    /// Read a relation ordered by an explicit sequence column, which is left out
    /// of the returned columns.
    pub fn read_sequenced(&self, name: &str, sequence_column: &str) -> Result<Relation> {
        let db = self.lock_conn();
        read_relation(&db, name, Some(sequence_column))
    }

    /// Read a live table together with its catalog version in one transaction.
    pub fn snapshot(&self, name: &str) -> Result<TableSnapshot> {
        let mut db = self.lock_conn();
        let tx = db.transaction()?;
        let version = version_in(&tx, name)?;
        let relation = if table_exists_in(&tx, name)? {
            Some(read_relation(&tx, name, None)?)
        } else {
            None
        };
        tx.commit()?;
        Ok(TableSnapshot { relation, version })
    }

    /// Create `name` and bulk load `relation` in a single transaction.
    ///
    /// With `sequence_column`, every row also gets its zero-based position in
    /// that column. Fails if a relation with this name already exists.
    pub fn create_table(
        &self,
        name: &str,
        relation: &Relation,
        sequence_column: Option<&str>,
    ) -> Result<()> {
        let mut db = self.lock_conn();
        let tx = db.transaction()?;

        let mut column_defs: Vec<String> = Vec::with_capacity(relation.columns.len() + 1);
        let mut insert_cols: Vec<String> = Vec::with_capacity(relation.columns.len() + 1);
        if let Some(seq) = sequence_column {
            column_defs.push(format!("{} INTEGER NOT NULL", quote_ident(seq)));
            insert_cols.push(quote_ident(seq));
        }
        for col in &relation.columns {
            column_defs.push(format!("{} {}", quote_ident(&col.name), col.column_type.sql_name()));
            insert_cols.push(quote_ident(&col.name));
        }
        if column_defs.is_empty() {
            return Err(IngestError::Config(format!(
                "Cannot create table {} without columns",
                name
            )));
        }

        tx.execute(
            &format!("CREATE TABLE {} ({})", quote_ident(name), column_defs.join(", ")),
            [],
        )?;

        if !relation.rows.is_empty() {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(name),
                insert_cols.join(", "),
                (1..=insert_cols.len()).map(|i| format!("?{}", i)).join(", ")
            );
            let mut stmt = tx.prepare(&sql)?;
            for (seq, row) in relation.rows.iter().enumerate() {
                match sequence_column {
                    Some(_) => stmt.execute(params_from_iter(
                        std::iter::once(Value::Integer(seq as i64)).chain(row.iter().cloned()),
                    ))?,
                    None => stmt.execute(params_from_iter(row.iter()))?,
                };
            }
        }

        tx.commit()?;
        debug!("Created {} with {} row(s)", name, relation.len());
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let db = self.lock_conn();
        db.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])?;
        Ok(())
    }

    /// Catalog version of a live table; 0 when it has never been swapped in.
    pub fn table_version(&self, name: &str) -> Result<i64> {
        let db = self.lock_conn();
        version_in(&db, name)
    }

    pub fn catalog_entry(&self, name: &str) -> Result<Option<CatalogEntry>> {
        let db = self.lock_conn();
        let entry = db
            .query_row(
                &format!(
                    "SELECT table_name, version, row_count, last_source, updated_at FROM {} WHERE table_name = ?1",
                    quote_ident(CATALOG_TABLE)
                ),
                params![name],
                |row| {
                    Ok(CatalogEntry {
                        table_name: row.get(0)?,
                        version: row.get(1)?,
                        row_count: row.get(2)?,
                        last_source: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Replace `live` with the fully written relation `staged`.
    ///
    /// Drop, rename and catalog bump commit as one immediate transaction, so a
    /// reader sees either the old table or the new one. Rejected with
    /// [`IngestError::ConcurrentModification`] if the live table's version is no
    /// longer `expected_version`. Returns the new version.
    pub fn swap_in(
        &self,
        staged: &str,
        live: &str,
        expected_version: i64,
        source: Option<&str>,
    ) -> Result<i64> {
        let mut db = self.lock_conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let found = version_in(&tx, live)?;
        if found != expected_version {
            return Err(IngestError::ConcurrentModification {
                table: live.to_string(),
                expected: expected_version,
                found,
            });
        }

        tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(live)), [])?;
        tx.execute(
            &format!("ALTER TABLE {} RENAME TO {}", quote_ident(staged), quote_ident(live)),
            [],
        )?;

        let row_count: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(live)),
            [],
            |row| row.get(0),
        )?;
        let version = found + 1;
        tx.execute(
            &format!(
                r#"
                INSERT INTO {} (table_name, version, row_count, last_source, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(table_name) DO UPDATE SET
                    version = excluded.version,
                    row_count = excluded.row_count,
                    last_source = excluded.last_source,
                    updated_at = excluded.updated_at
                "#,
                quote_ident(CATALOG_TABLE)
            ),
            params![live, version, row_count, source, Utc::now().to_rfc3339()],
        )?;

        tx.commit()?;
        debug!("Swapped {} into {} at version {}", staged, live, version);
        Ok(version)
    }
}

fn table_exists_in(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn version_in(conn: &Connection, name: &str) -> Result<i64> {
    let version = conn
        .query_row(
            &format!(
                "SELECT version FROM {} WHERE table_name = ?1",
                quote_ident(CATALOG_TABLE)
            ),
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn columns_of(conn: &Connection, name: &str) -> Result<Vec<Column>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
    let columns = stmt
        .query_map([], |row| {
            let col_name: String = row.get(1)?;
            let declared: String = row.get(2)?;
            Ok(Column::new(col_name, ColumnType::from_declared(&declared)))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn read_relation(conn: &Connection, name: &str, sequence_column: Option<&str>) -> Result<Relation> {
    let columns: Vec<Column> = columns_of(conn, name)?
        .into_iter()
        .filter(|c| Some(c.name.as_str()) != sequence_column)
        .collect();
    if columns.is_empty() {
        return Ok(Relation::new(columns, Vec::new()));
    }

    let order_by = match sequence_column {
        Some(seq) => quote_ident(seq),
        None => "rowid".to_string(),
    };
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        columns.iter().map(|c| quote_ident(&c.name)).join(", "),
        quote_ident(name),
        order_by
    );

    let width = columns.len();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|i| row.get::<_, SqlValue>(i).map(Value::from))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Relation::new(columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Relation {
        Relation::new(
            vec![
                Column::new("Country/Region", ColumnType::Text),
                Column::new("cases", ColumnType::Integer),
            ],
            vec![
                vec![Value::Text("Chad".into()), Value::Integer(3)],
                vec![Value::Text("Peru".into()), Value::Null],
            ],
        )
    }

    #[test]
    fn test_create_and_read_back() {
        let store = Store::open_in_memory().unwrap();
        store.create_table("corona", &sample(), None).unwrap();

        assert!(store.table_exists("corona").unwrap());
        assert_eq!(store.read_table("corona").unwrap(), Some(sample()));
        assert_eq!(store.row_count("corona").unwrap(), 2);
        assert!(store.read_table("missing").unwrap().is_none());
    }

    #[test]
    fn test_sequenced_read_hides_sequence_column() {
        let store = Store::open_in_memory().unwrap();
        let staging = staging_name("corona", "a1");
        store.create_table(&staging, &sample(), Some("__ingest_seq")).unwrap();
        assert_eq!(store.read_sequenced(&staging, "__ingest_seq").unwrap(), sample());
    }

    #[test]
    fn test_create_existing_relation_fails() {
        let store = Store::open_in_memory().unwrap();
        store.create_table("t", &sample(), None).unwrap();
        assert!(matches!(
            store.create_table("t", &sample(), None),
            Err(IngestError::Store(_))
        ));
    }

    #[test]
    fn test_swap_replaces_and_bumps_version() {
        let store = Store::open_in_memory().unwrap();
        let next = next_name("corona", "a1");
        store.create_table(&next, &sample(), None).unwrap();
        assert_eq!(store.swap_in(&next, "corona", 0, Some("day_wise.csv")).unwrap(), 1);

        assert!(!store.table_exists(&next).unwrap());
        let entry = store.catalog_entry("corona").unwrap().unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.row_count, 2);
        assert_eq!(entry.last_source.as_deref(), Some("day_wise.csv"));

        let next = next_name("corona", "a2");
        let mut smaller = sample();
        smaller.rows.truncate(1);
        store.create_table(&next, &smaller, None).unwrap();
        assert_eq!(store.swap_in(&next, "corona", 1, None).unwrap(), 2);
        assert_eq!(store.row_count("corona").unwrap(), 1);
    }

    #[test]
    fn test_stale_version_is_rejected_and_live_table_kept() {
        let store = Store::open_in_memory().unwrap();
        let first = next_name("t", "a1");
        store.create_table(&first, &sample(), None).unwrap();
        store.swap_in(&first, "t", 0, None).unwrap();

        let stale = next_name("t", "a2");
        store.create_table(&stale, &Relation::new(sample().columns, vec![]), None).unwrap();
        let err = store.swap_in(&stale, "t", 0, None).unwrap_err();
        assert!(matches!(err, IngestError::ConcurrentModification { expected: 0, found: 1, .. }));
        assert_eq!(store.row_count("t").unwrap(), 2);
        assert!(store.table_exists(&stale).unwrap());
    }

    #[test]
    fn test_list_tables_hides_bookkeeping() {
        let store = Store::open_in_memory().unwrap();
        store.create_table("youtube_usvideos", &sample(), None).unwrap();
        let attempt = new_attempt_id();
        store.create_table(&staging_name("youtube_usvideos", &attempt), &sample(), Some("__ingest_seq")).unwrap();
        store.create_table(&next_name("youtube_usvideos", &attempt), &sample(), None).unwrap();
        assert_eq!(store.list_tables().unwrap(), vec!["youtube_usvideos"]);
    }

    #[test]
    fn test_marker_inside_a_live_name_stays_visible() {
        let store = Store::open_in_memory().unwrap();
        store.create_table("x__next_y", &sample(), None).unwrap();
        store.create_table("plan__staging_2024", &sample(), None).unwrap();
        assert_eq!(store.list_tables().unwrap(), vec!["plan__staging_2024", "x__next_y"]);

        assert!(is_transient(&next_name("x", &new_attempt_id())));
        assert!(!is_transient(&next_name("", &new_attempt_id())));
        assert!(!is_transient("x__next_y"));
    }

    #[test]
    fn test_on_disk_store_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("lake").join("minilake.sqlite");
        {
            let store = Store::open(&path, Duration::from_millis(500)).unwrap();
            let next = next_name("t", "a");
            store.create_table(&next, &sample(), None).unwrap();
            store.swap_in(&next, "t", 0, None).unwrap();
        }
        let reopened = Store::open(&path, Duration::from_millis(500)).unwrap();
        assert_eq!(reopened.read_table("t").unwrap(), Some(sample()));
        assert_eq!(reopened.table_version("t").unwrap(), 1);
    }
}
