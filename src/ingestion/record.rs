//! Record model - Typed cells, columns and in-memory relations

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};

/// A single typed cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical comparison form used for key matching.
    ///
    /// `5`, `5.0` and `"5"` share one form so that a column whose inferred type
    /// drifts between files still matches itself. Null has no form.
    pub fn canonical(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some((*f as i64).to_string())
                } else {
                    Some(f.to_string())
                }
            }
            Value::Text(s) => Some(s.clone()),
        }
    }
}

impl From<SqlValue> for Value {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::Integer(i),
            SqlValue::Real(f) => Value::Real(f),
            SqlValue::Text(s) => Value::Text(s),
            SqlValue::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// Inferred column type. Ordering is the widening order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    /// Map a declared SQLite column type back to a column type.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("BOOL") {
            ColumnType::Boolean
        } else if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnType::Real
        } else {
            ColumnType::Text
        }
    }

    /// Smallest type able to hold values of both.
    pub fn widen(self, other: ColumnType) -> ColumnType {
        self.max(other)
    }

    /// Infer the narrowest type holding every non-empty cell.
    pub fn infer<'a>(cells: impl IntoIterator<Item = &'a str>) -> ColumnType {
        let mut inferred: Option<ColumnType> = None;
        for cell in cells {
            if cell.is_empty() {
                continue;
            }
            let cell_type = if parse_bool(cell).is_some() {
                ColumnType::Boolean
            } else if cell.parse::<i64>().is_ok() {
                ColumnType::Integer
            } else if cell.parse::<f64>().is_ok() {
                ColumnType::Real
            } else {
                return ColumnType::Text;
            };
            inferred = Some(match inferred {
                None => cell_type,
                // booleans only stay boolean when every cell is one
                Some(ColumnType::Boolean) if cell_type != ColumnType::Boolean => ColumnType::Text,
                Some(prev) if prev != ColumnType::Boolean && cell_type == ColumnType::Boolean => {
                    ColumnType::Text
                }
                Some(prev) => prev.widen(cell_type),
            });
        }
        inferred.unwrap_or(ColumnType::Text)
    }

    /// Convert a raw cell into a value of this type.
    pub fn coerce(self, cell: &str) -> Value {
        if cell.is_empty() {
            return Value::Null;
        }
        match self {
            ColumnType::Boolean => match parse_bool(cell) {
                Some(b) => Value::Integer(i64::from(b)),
                None => Value::Text(cell.to_string()),
            },
            ColumnType::Integer => cell
                .parse::<i64>()
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::Text(cell.to_string())),
            ColumnType::Real => cell
                .parse::<f64>()
                .map(Value::Real)
                .unwrap_or_else(|_| Value::Text(cell.to_string())),
            ColumnType::Text => Value::Text(cell.to_string()),
        }
    }

    /// Convert an already typed value into a column of this type.
    ///
    /// After conversion a value is stored exactly as held, so key comparison on
    /// the converted value agrees with what a later read returns.
    pub fn convert(self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (ColumnType::Text, Value::Integer(i)) => Value::Text(i.to_string()),
            (ColumnType::Text, Value::Real(f)) => Value::Text(render_real(f)),
            (ColumnType::Real, Value::Integer(i)) => Value::Real(i as f64),
            (ColumnType::Integer, Value::Real(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                Value::Integer(f as i64)
            }
            (_, value) => value,
        }
    }
}

/// Text form of a real as SQLite renders it for integral values (`5.0`, not `5`).
fn render_real(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1.0e15 {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

fn parse_bool(cell: &str) -> Option<bool> {
    if cell.eq_ignore_ascii_case("true") {
        Some(true)
    } else if cell.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

pub type Row = Vec<Value>;

/// An ordered, in-memory relation. Row order is recency order: later rows are newer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Relation {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl Relation {
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Build a relation from raw text cells, inferring one type per column.
    pub fn from_text(header: Vec<String>, records: Vec<Vec<String>>) -> Self {
        let columns: Vec<Column> = header
            .into_iter()
            .enumerate()
            .map(|(idx, name)| {
                let column_type =
                    ColumnType::infer(records.iter().filter_map(|r| r.get(idx).map(String::as_str)));
                Column::new(name, column_type)
            })
            .collect();

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        record
                            .get(idx)
                            .map(|cell| col.column_type.coerce(cell))
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    /// Look up a cell by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }
}
