//! Merge Engine - Last-write-per-key-wins upsert of a staged batch into an existing table
//!
//! Every input row gets an explicit [`RecencyMarker`]: existing rows in read order,
//! then staged rows in file order. For each distinct key tuple the row with the
//! highest marker survives. Rows with a null in any key column never collide
//! (unless the key says otherwise) and are only collapsed when they are exact
//! duplicates of an earlier row, which keeps re-ingestion idempotent.

use crate::ingestion::record::{Column, Relation, Row, Value};
use crate::ingestion::schema_registry::KeySpec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Where an input row came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Existing,
    Staged,
}

/// Strictly increasing position of a row in the union of existing and staged rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecencyMarker(u64);

impl RecencyMarker {
    /// Staged rows always rank after every existing row.
    pub fn new(origin: Origin, position: usize, existing_len: usize) -> Self {
        match origin {
            Origin::Existing => RecencyMarker(position as u64),
            Origin::Staged => RecencyMarker((existing_len + position) as u64),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub existing_rows: usize,
    pub staged_rows: usize,
    /// Existing rows shadowed by a staged row with the same key
    pub replaced: usize,
    /// Rows shadowed by a later row of the same origin, or exact null-key duplicates
    pub collapsed: usize,
    /// Input rows whose key contained a null
    pub null_key_rows: usize,
    pub output_rows: usize,
}

#[derive(Clone, Debug)]
pub struct MergeOutput {
    pub relation: Relation,
    pub stats: MergeStats,
    /// Key columns absent from both inputs
    pub missing_key_columns: Vec<String>,
}

struct Tagged {
    recency: RecencyMarker,
    origin: Origin,
    row: Row,
}

type KeyTuple = Vec<Option<String>>;

pub struct MergeEngine;

impl MergeEngine {
    /// Merge `staged` into `existing` (absent on first ingestion) under `key`.
    pub fn merge(existing: Option<&Relation>, staged: &Relation, key: &KeySpec) -> MergeOutput {
        let empty = Relation::default();
        let existing = existing.unwrap_or(&empty);

        let (columns, existing_map, staged_map) = union_columns(&existing.columns, &staged.columns);

        let key_indices: Vec<Option<usize>> = key
            .columns
            .iter()
            .map(|k| columns.iter().position(|c| c.name.eq_ignore_ascii_case(k)))
            .collect();
        let missing_key_columns: Vec<String> = key
            .columns
            .iter()
            .zip(&key_indices)
            .filter(|(_, idx)| idx.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        // with no key column at all, nothing may collide, whatever nulls_collide says
        let key_indices = if key_indices.iter().all(Option::is_none) {
            Vec::new()
        } else {
            key_indices
        };

        let mut stats = MergeStats {
            existing_rows: existing.len(),
            staged_rows: staged.len(),
            ..MergeStats::default()
        };

        let inputs = existing
            .rows
            .iter()
            .enumerate()
            .map(|(pos, row)| (Origin::Existing, pos, align(row, &existing_map, &columns)))
            .chain(
                staged
                    .rows
                    .iter()
                    .enumerate()
                    .map(|(pos, row)| (Origin::Staged, pos, align(row, &staged_map, &columns))),
            );

        let mut survivors: Vec<Option<Tagged>> = Vec::with_capacity(existing.len() + staged.len());
        let mut latest: HashMap<KeyTuple, usize> = HashMap::new();
        let mut keyless_seen: HashSet<KeyTuple> = HashSet::new();

        for (origin, pos, row) in inputs {
            let tagged = Tagged {
                recency: RecencyMarker::new(origin, pos, existing.len()),
                origin,
                row,
            };

            let Some(key_tuple) = key_of(&tagged.row, &key_indices, key.nulls_collide) else {
                stats.null_key_rows += 1;
                if keyless_seen.insert(fingerprint(&tagged.row)) {
                    survivors.push(Some(tagged));
                } else {
                    stats.collapsed += 1;
                }
                continue;
            };

            match latest.get(&key_tuple).copied() {
                Some(prev_idx) => {
                    let prev_wins = survivors[prev_idx]
                        .as_ref()
                        .is_some_and(|prev| prev.recency > tagged.recency);
                    if prev_wins {
                        stats.collapsed += 1;
                        continue;
                    }
                    if let Some(prev) = survivors[prev_idx].take() {
                        match (prev.origin, tagged.origin) {
                            (Origin::Existing, Origin::Staged) => stats.replaced += 1,
                            _ => stats.collapsed += 1,
                        }
                    }
                    latest.insert(key_tuple, survivors.len());
                    survivors.push(Some(tagged));
                }
                None => {
                    latest.insert(key_tuple, survivors.len());
                    survivors.push(Some(tagged));
                }
            }
        }

        let rows: Vec<Row> = survivors.into_iter().flatten().map(|t| t.row).collect();
        stats.output_rows = rows.len();

        MergeOutput {
            relation: Relation::new(columns, rows),
            stats,
            missing_key_columns,
        }
    }
}

/// Existing columns first, then new staged columns; types widen on overlap.
/// Names match ignoring ASCII case, as SQLite identifiers do; the existing spelling is kept.
/// Returns the output columns and, per input, the output index of each input column.
fn union_columns(existing: &[Column], staged: &[Column]) -> (Vec<Column>, Vec<usize>, Vec<usize>) {
    let mut columns: Vec<Column> = existing.to_vec();
    let existing_map: Vec<usize> = (0..existing.len()).collect();
    let mut staged_map = Vec::with_capacity(staged.len());

    for col in staged {
        match columns.iter().position(|c| c.name.eq_ignore_ascii_case(&col.name)) {
            Some(idx) => {
                columns[idx].column_type = columns[idx].column_type.widen(col.column_type);
                staged_map.push(idx);
            }
            None => {
                staged_map.push(columns.len());
                columns.push(col.clone());
            }
        }
    }

    (columns, existing_map, staged_map)
}

/// Place a row's cells at their output positions, converted to the output types.
fn align(row: &[Value], mapping: &[usize], columns: &[Column]) -> Row {
    let mut out = vec![Value::Null; columns.len()];
    for (value, &target) in row.iter().zip(mapping) {
        out[target] = columns[target].column_type.convert(value.clone());
    }
    out
}

fn key_of(row: &[Value], key_indices: &[Option<usize>], nulls_collide: bool) -> Option<KeyTuple> {
    if key_indices.is_empty() {
        return None;
    }
    let tuple: KeyTuple = key_indices
        .iter()
        .map(|idx| idx.and_then(|i| row[i].canonical()))
        .collect();
    if !nulls_collide && tuple.iter().any(Option::is_none) {
        return None;
    }
    Some(tuple)
}

fn fingerprint(row: &[Value]) -> KeyTuple {
    row.iter().map(Value::canonical).collect()
}
