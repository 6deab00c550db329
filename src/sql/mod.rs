//! SQL values, dialects and statement translation.
//!
//! Producers describe writes with backend-neutral [`FieldValue`]s and
//! canonical placeholders (`?` and `:name`). The [`Translator`] turns a
//! message into a [`Statement`] for whichever [`Dialect`] is active.

pub mod dialect;
pub mod translate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use dialect::{dialect_for, Dialect, PostgresDialect, SqliteDialect};
pub use translate::{
    epoch_to_datetime, TranslateError, Translator, DEFAULT_TIMESTAMP_COLUMNS, LOG_COLUMNS,
};

/// A value as the producer wrote it.
///
/// This is the canonical representation stored in the queue. Coercion to a
/// backend happens at translation time and never rewrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    /// Seconds (or milliseconds) since the Unix epoch.
    Epoch(f64),
    /// The time the statement is translated, not the time it was enqueued.
    Now,
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Column data for structured operations, in column-name order.
pub type Row = BTreeMap<String, FieldValue>;

/// Build a [`Row`] from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FieldValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Parameters for a raw statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "style", content = "values", rename_all = "snake_case")]
pub enum Params {
    /// Bound to `?` placeholders in order.
    Positional(Vec<FieldValue>),
    /// Bound to `:name` placeholders.
    Named(BTreeMap<String, FieldValue>),
}

impl Params {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Positional(values) => values.is_empty(),
            Self::Named(values) => values.is_empty(),
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

/// A value ready to bind on the active backend.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// A statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// SQLite's native timestamp text, e.g. `2024-05-01 12:00:00.000000`.
pub fn format_sqlite_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Check a table or column name: `name` or `schema.name`, each part
/// `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes.
pub fn is_valid_identifier(ident: &str) -> bool {
    let parts: Vec<&str> = ident.split('.').collect();
    if parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}
