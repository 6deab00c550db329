//! Message to statement translation.
//!
//! Translation is a pure function of the queued message, the active dialect
//! and the clock passed in. It never rewrites the message, so translating a
//! requeued message again yields the same statement and parameters.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

use super::{Dialect, FieldValue, Params, SqlValue, Statement};
use crate::message::{LogRecord, Operation, WriteMessage};

/// Columns whose numeric values are Unix timestamps.
pub const DEFAULT_TIMESTAMP_COLUMNS: &[&str] = &[
    "timestamp",
    "created_at",
    "updated_at",
    "last_seen",
    "last_heartbeat",
    "executed_at",
    "started_at",
    "ended_at",
];

/// Columns of the batch log table, in insert order.
pub const LOG_COLUMNS: [&str; 4] = ["source", "level", "message", "created_at"];

/// Epochs at or above this are taken to be milliseconds.
const MILLIS_THRESHOLD: f64 = 1e11;

/// Error type for translation.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(f64),

    #[error("placeholder style does not match the parameters")]
    ParameterStyle,

    #[error("statement has {placeholders} positional placeholders but {values} values")]
    ParameterCount { placeholders: usize, values: usize },

    #[error("missing value for :{0}")]
    MissingParameter(String),

    #[error("unterminated quoted section or comment in statement")]
    Unterminated,

    #[error("message has no statement")]
    MissingStatement,

    #[error("log batch is empty")]
    EmptyBatch,
}

/// Turns queued messages into statements for one dialect.
#[derive(Debug, Clone)]
pub struct Translator {
    dialect: Arc<dyn Dialect>,
    timestamp_columns: BTreeSet<String>,
}

impl Translator {
    /// Create a translator with [`DEFAULT_TIMESTAMP_COLUMNS`].
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self {
            dialect,
            timestamp_columns: DEFAULT_TIMESTAMP_COLUMNS
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
        }
    }

    /// Replace the set of timestamp-bearing columns.
    #[must_use]
    pub fn with_timestamp_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.timestamp_columns = columns
            .into_iter()
            .map(|c| c.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    fn is_timestamp_column(&self, column: &str) -> bool {
        self.timestamp_columns
            .contains(&column.to_ascii_lowercase())
    }

    /// Build the statement for `msg`, resolving `Now` to `now`.
    ///
    /// # Errors
    ///
    /// Returns a [`TranslateError`] when a timestamp is out of range, the
    /// placeholders do not match the parameters, or a quote, comment or
    /// dollar-quoted body is left open.
    pub fn translate(
        &self,
        msg: &WriteMessage,
        now: DateTime<Utc>,
    ) -> Result<Statement, TranslateError> {
        match msg.operation() {
            Operation::Insert => self.translate_insert(msg, now),
            Operation::Update => self.translate_update(msg, now),
            Operation::Execute => self.translate_execute(msg, now),
        }
    }

    fn translate_insert(
        &self,
        msg: &WriteMessage,
        now: DateTime<Utc>,
    ) -> Result<Statement, TranslateError> {
        let columns: Vec<&str> = msg.data().keys().map(String::as_str).collect();
        let sql = if msg.conflict_key().is_empty() {
            self.dialect.insert(msg.table(), &columns)
        } else {
            let key: Vec<&str> = msg.conflict_key().iter().map(String::as_str).collect();
            self.dialect.upsert(msg.table(), &columns, &key)
        };

        let params = msg
            .data()
            .iter()
            .map(|(column, value)| self.coerce(Some(column), value, now))
            .collect::<Result<_, _>>()?;

        Ok(Statement { sql, params })
    }

    fn translate_update(
        &self,
        msg: &WriteMessage,
        now: DateTime<Utc>,
    ) -> Result<Statement, TranslateError> {
        let set_columns: Vec<&str> = msg.data().keys().map(String::as_str).collect();
        let filter_columns: Vec<&str> = msg.filter().keys().map(String::as_str).collect();
        let sql = self
            .dialect
            .update(msg.table(), &set_columns, &filter_columns);

        let params = msg
            .data()
            .iter()
            .chain(msg.filter().iter())
            .map(|(column, value)| self.coerce(Some(column), value, now))
            .collect::<Result<_, _>>()?;

        Ok(Statement { sql, params })
    }

    fn translate_execute(
        &self,
        msg: &WriteMessage,
        now: DateTime<Utc>,
    ) -> Result<Statement, TranslateError> {
        let raw = msg.sql().ok_or(TranslateError::MissingStatement)?;
        let scanned = scan_placeholders(raw)?;

        let mut params = Vec::with_capacity(scanned.placeholders.len());
        match msg.params() {
            Params::Positional(values) => {
                if scanned
                    .placeholders
                    .iter()
                    .any(|p| matches!(p, Placeholder::Named(_)))
                {
                    return Err(TranslateError::ParameterStyle);
                }
                if scanned.placeholders.len() != values.len() {
                    return Err(TranslateError::ParameterCount {
                        placeholders: scanned.placeholders.len(),
                        values: values.len(),
                    });
                }
                for value in values {
                    params.push(self.coerce(None, value, now)?);
                }
            }
            Params::Named(values) => {
                for placeholder in &scanned.placeholders {
                    let Placeholder::Named(name) = placeholder else {
                        return Err(TranslateError::ParameterStyle);
                    };
                    let value = values
                        .get(*name)
                        .ok_or_else(|| TranslateError::MissingParameter((*name).to_string()))?;
                    params.push(self.coerce(Some(name), value, now)?);
                }
            }
        }

        let mut sql = String::with_capacity(raw.len() + params.len() * 2);
        for (i, piece) in scanned.pieces.iter().enumerate() {
            sql.push_str(piece);
            if i < scanned.placeholders.len() {
                sql.push_str(&self.dialect.placeholder(i + 1));
            }
        }

        Ok(Statement { sql, params })
    }

    /// Build one multi-row insert for a batch of log records.
    pub fn translate_log_batch(
        &self,
        table: &str,
        records: &[LogRecord],
    ) -> Result<Statement, TranslateError> {
        if records.is_empty() {
            return Err(TranslateError::EmptyBatch);
        }

        let sql = self
            .dialect
            .multi_row_insert(table, &LOG_COLUMNS, records.len());
        let mut params = Vec::with_capacity(records.len() * LOG_COLUMNS.len());
        for record in records {
            params.push(SqlValue::Text(record.source.clone()));
            params.push(SqlValue::Text(record.level.clone()));
            params.push(SqlValue::Text(record.message.clone()));
            params.push(self.dialect.timestamp(epoch_to_datetime(record.created_at)?));
        }

        Ok(Statement { sql, params })
    }

    fn coerce(
        &self,
        column: Option<&str>,
        value: &FieldValue,
        now: DateTime<Utc>,
    ) -> Result<SqlValue, TranslateError> {
        let timestamp_column = column.is_some_and(|c| self.is_timestamp_column(c));
        Ok(match value {
            FieldValue::Null => SqlValue::Null,
            FieldValue::Bool(b) => SqlValue::Bool(*b),
            FieldValue::Integer(i) if timestamp_column => {
                self.dialect.timestamp(epoch_to_datetime(*i as f64)?)
            }
            FieldValue::Integer(i) => SqlValue::Integer(*i),
            FieldValue::Real(f) if timestamp_column => {
                self.dialect.timestamp(epoch_to_datetime(*f)?)
            }
            FieldValue::Real(f) => SqlValue::Real(*f),
            FieldValue::Text(s) => SqlValue::Text(s.clone()),
            FieldValue::Epoch(secs) => self.dialect.timestamp(epoch_to_datetime(*secs)?),
            FieldValue::Now => self.dialect.timestamp(now),
        })
    }
}

/// Convert a Unix epoch in seconds (or milliseconds) to a UTC time.
pub fn epoch_to_datetime(epoch: f64) -> Result<DateTime<Utc>, TranslateError> {
    if !epoch.is_finite() {
        return Err(TranslateError::InvalidTimestamp(epoch));
    }
    let micros = if epoch.abs() >= MILLIS_THRESHOLD {
        epoch * 1_000.0
    } else {
        epoch * 1_000_000.0
    };
    DateTime::from_timestamp_micros(micros.round() as i64)
        .ok_or(TranslateError::InvalidTimestamp(epoch))
}

#[derive(Debug, PartialEq)]
enum Placeholder<'s> {
    Positional,
    Named(&'s str),
}

/// A statement split around its placeholders.
///
/// `pieces.len() == placeholders.len() + 1`.
#[derive(Debug)]
struct Scanned<'s> {
    pieces: Vec<&'s str>,
    placeholders: Vec<Placeholder<'s>>,
}

/// Length of the dollar-quote opener (`$$` or `$tag$`) at the start of
/// `bytes`, if there is one. `$1` is a parameter, not a tag.
fn dollar_tag(bytes: &[u8]) -> Option<usize> {
    let rest = bytes.get(1..)?;
    if rest.first() == Some(&b'$') {
        return Some(2);
    }
    if !rest.first().is_some_and(|&b| b.is_ascii_alphabetic() || b == b'_') {
        return None;
    }
    let ident = rest
        .iter()
        .take_while(|&&b| b.is_ascii_alphanumeric() || b == b'_')
        .count();
    (rest.get(ident) == Some(&b'$')).then_some(ident + 2)
}

/// Find `?` and `:name` placeholders outside quotes, comments and
/// dollar-quoted bodies.
///
/// `::` casts are left alone.
fn scan_placeholders(sql: &str) -> Result<Scanned<'_>, TranslateError> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut pieces = Vec::new();
    let mut placeholders = Vec::new();
    let mut piece_start = 0;
    let mut i = 0;

    let is_ident_start = |b: u8| b.is_ascii_alphabetic() || b == b'_';
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    while i < len {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(TranslateError::Unterminated),
                        Some(&b) if b == quote => {
                            // A doubled quote is an escaped quote.
                            if bytes.get(i + 1) == Some(&quote) {
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < len && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..]
                    .find("*/")
                    .ok_or(TranslateError::Unterminated)?;
                i += 2 + end + 2;
            }
            b'$' => match dollar_tag(&bytes[i..]) {
                Some(tag_len) => {
                    let tag = &sql[i..i + tag_len];
                    let body = i + tag_len;
                    let end = sql[body..]
                        .find(tag)
                        .ok_or(TranslateError::Unterminated)?;
                    i = body + end + tag_len;
                }
                None => i += 1,
            },
            b':' if bytes.get(i + 1) == Some(&b':') => i += 2,
            b':' if bytes.get(i + 1).is_some_and(|&b| is_ident_start(b)) => {
                let start = i + 1;
                let mut end = start;
                while end < len && is_ident(bytes[end]) {
                    end += 1;
                }
                pieces.push(&sql[piece_start..i]);
                placeholders.push(Placeholder::Named(&sql[start..end]));
                i = end;
                piece_start = end;
            }
            b'?' => {
                pieces.push(&sql[piece_start..i]);
                placeholders.push(Placeholder::Positional);
                i += 1;
                piece_start = i;
            }
            _ => i += 1,
        }
    }
    pieces.push(&sql[piece_start..]);

    Ok(Scanned {
        pieces,
        placeholders,
    })
}
