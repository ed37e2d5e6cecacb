//! Statements: the abstract, idempotent mutations reducers emit.
//!
//! A reducer never touches the database. It returns a list of
//! [`Statement`] values, which the executor renders to SQL and runs inside
//! the projection transaction.

use chrono::{DateTime, Utc};
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value as SqlValue};

/// A column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Stored as `0` / `1`.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Stored as Unix milliseconds.
    Timestamp(DateTime<Utc>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Int(crate::sqlite::to_sql_int(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqlValue::Null),
            Self::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Self::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Self::Text(s) => ToSqlOutput::Borrowed(s.as_str().into()),
            Self::Timestamp(ts) => ToSqlOutput::Owned(SqlValue::Integer(ts.timestamp_millis())),
        })
    }
}

/// A `(name, value)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name. Always a compile-time identifier, never user input.
    pub name: &'static str,
    /// Bound value.
    pub value: Value,
}

impl Column {
    /// Build a column.
    pub fn new(name: &'static str, value: impl Into<Value>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

/// One idempotent mutation of a read-model table.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Insert the row identified by `key`, or overwrite its `columns`.
    Upsert {
        /// Target table.
        table: &'static str,
        /// Primary-key columns; must match the table's conflict target.
        key: Vec<Column>,
        /// Non-key columns to write.
        columns: Vec<Column>,
    },
    /// Delete the rows matching every `key` column.
    Delete {
        /// Target table.
        table: &'static str,
        /// Match columns; an empty key is refused by the executor.
        key: Vec<Column>,
    },
}

impl Statement {
    /// Target table.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Upsert { table, .. } | Self::Delete { table, .. } => table,
        }
    }

    /// Key columns.
    pub fn key(&self) -> &[Column] {
        match self {
            Self::Upsert { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    /// Look up a key or value column by name.
    pub fn column(&self, name: &str) -> Option<&Value> {
        let columns: &[Column] = match self {
            Self::Upsert { columns, .. } => columns,
            Self::Delete { .. } => &[],
        };
        self.key()
            .iter()
            .chain(columns)
            .find(|c| c.name == name)
            .map(|c| &c.value)
    }

    /// Render to `SQLite` SQL with positional parameters and return the
    /// values to bind, in order.
    pub fn to_sql(&self) -> (String, Vec<&Value>) {
        match self {
            Self::Upsert {
                table,
                key,
                columns,
            } => {
                let names: Vec<&str> = key.iter().chain(columns).map(|c| c.name).collect();
                let marks: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
                let conflict: Vec<&str> = key.iter().map(|c| c.name).collect();
                let action = if columns.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    let sets: Vec<String> = columns
                        .iter()
                        .map(|c| format!("{0} = excluded.{0}", c.name))
                        .collect();
                    format!("DO UPDATE SET {}", sets.join(", "))
                };
                let sql = format!(
                    "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) {action}",
                    names.join(", "),
                    marks.join(", "),
                    conflict.join(", "),
                );
                let values = key.iter().chain(columns).map(|c| &c.value).collect();
                (sql, values)
            }
            Self::Delete { table, key } => {
                let conds: Vec<String> = key
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("({} = ?{})", c.name, i + 1))
                    .collect();
                let sql = format!("DELETE FROM {table} WHERE {}", conds.join(" AND "));
                (sql, key.iter().map(|c| &c.value).collect())
            }
        }
    }
}
