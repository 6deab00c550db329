//! Units of work enqueued by producers.
//!
//! A [`WriteMessage`] is validated when it is built and never changes after
//! it is enqueued. A retry enqueues a copy made by
//! [`WriteMessage::next_attempt`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::sql::{is_valid_identifier, Params, Row};
use crate::{generate_message_id, now_millis};

/// Error type for message construction and decoding.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("table name cannot be empty")]
    EmptyTable,

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("execute requires a non-empty statement")]
    MissingStatement,

    #[error("{0} requires column data")]
    MissingData(Operation),

    #[error("update requires a filter")]
    MissingFilter,

    #[error("conflict key column {0:?} is not in the data")]
    ConflictKeyNotInData(String),

    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a message does to its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Insert a row, or upsert when a conflict key is given.
    Insert,
    /// Update rows matching a filter.
    Update,
    /// Run a raw statement.
    Execute,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drain class of a message. Determines order, not semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    Priority,
    Normal,
}

impl Priority {
    /// All classes in drain order.
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Priority, Priority::Normal];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Priority => "priority",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending database mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteMessage {
    message_id: String,
    operation: Operation,
    table: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    data: Row,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    filter: Row,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    conflict_key: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sql: Option<String>,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    params: Params,
    priority: Priority,
    source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    callback_key: Option<String>,
    /// Contention retries so far.
    #[serde(default)]
    attempt: u32,
    /// Enqueue time in Unix milliseconds.
    enqueued_at: i64,
}

impl WriteMessage {
    fn base(operation: Operation, table: String, source_id: &str, priority: Priority) -> Self {
        Self {
            message_id: generate_message_id(),
            operation,
            table,
            data: Row::new(),
            filter: Row::new(),
            conflict_key: Vec::new(),
            sql: None,
            params: Params::default(),
            priority,
            source_id: source_id.to_string(),
            callback_key: None,
            attempt: 0,
            enqueued_at: now_millis(),
        }
    }

    /// Insert one row into `table`.
    pub fn insert(
        table: &str,
        data: Row,
        source_id: &str,
        priority: Priority,
    ) -> Result<Self, MessageError> {
        let mut msg = Self::base(Operation::Insert, table.to_string(), source_id, priority);
        msg.data = data;
        msg.validate()?;
        Ok(msg)
    }

    /// Insert one row, updating the other columns when `conflict_key`
    /// already exists.
    pub fn upsert(
        table: &str,
        data: Row,
        conflict_key: &[&str],
        source_id: &str,
        priority: Priority,
    ) -> Result<Self, MessageError> {
        let mut msg = Self::base(Operation::Insert, table.to_string(), source_id, priority);
        msg.data = data;
        msg.conflict_key = conflict_key.iter().map(|k| (*k).to_string()).collect();
        msg.validate()?;
        Ok(msg)
    }

    /// Set `data` on rows whose columns equal `filter`.
    pub fn update(
        table: &str,
        data: Row,
        filter: Row,
        source_id: &str,
        priority: Priority,
    ) -> Result<Self, MessageError> {
        let mut msg = Self::base(Operation::Update, table.to_string(), source_id, priority);
        msg.data = data;
        msg.filter = filter;
        msg.validate()?;
        Ok(msg)
    }

    /// Run a raw statement written with `?` or `:name` placeholders.
    ///
    /// The table label is taken from the statement when it can be found.
    pub fn execute(
        sql: &str,
        params: Params,
        source_id: &str,
        priority: Priority,
    ) -> Result<Self, MessageError> {
        let table = statement_target(sql).unwrap_or_else(|| "raw".to_string());
        let mut msg = Self::base(Operation::Execute, table, source_id, priority);
        msg.sql = Some(sql.to_string());
        msg.params = params;
        msg.validate()?;
        Ok(msg)
    }

    /// Ask for a completion notice under `key`.
    #[must_use]
    pub fn with_callback(mut self, key: impl Into<String>) -> Self {
        self.callback_key = Some(key.into());
        self
    }

    /// A copy to re-enqueue after contention.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<(), MessageError> {
        if self.table.trim().is_empty() {
            return Err(MessageError::EmptyTable);
        }

        if self.operation == Operation::Execute {
            return match &self.sql {
                Some(sql) if !sql.trim().is_empty() => Ok(()),
                _ => Err(MessageError::MissingStatement),
            };
        }

        check_identifier(&self.table)?;
        if self.data.is_empty() {
            return Err(MessageError::MissingData(self.operation));
        }
        for column in self.data.keys().chain(self.filter.keys()) {
            check_identifier(column)?;
        }
        for key in &self.conflict_key {
            check_identifier(key)?;
            if !self.data.contains_key(key) {
                return Err(MessageError::ConflictKeyNotInData(key.clone()));
            }
        }
        if self.operation == Operation::Update && self.filter.is_empty() {
            return Err(MessageError::MissingFilter);
        }
        Ok(())
    }

    /// Serialize for the queue.
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize and re-validate a queued payload.
    pub fn decode(payload: &str) -> Result<Self, MessageError> {
        let msg: Self = serde_json::from_str(payload)?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn data(&self) -> &Row {
        &self.data
    }

    pub fn filter(&self) -> &Row {
        &self.filter
    }

    pub fn conflict_key(&self) -> &[String] {
        &self.conflict_key
    }

    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn callback_key(&self) -> Option<&str> {
        self.callback_key.as_deref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn enqueued_at(&self) -> i64 {
        self.enqueued_at
    }
}

fn check_identifier(ident: &str) -> Result<(), MessageError> {
    if is_valid_identifier(ident) {
        Ok(())
    } else {
        Err(MessageError::InvalidIdentifier(ident.to_string()))
    }
}

/// Best-effort target table of a raw DML statement.
fn statement_target(sql: &str) -> Option<String> {
    let words: Vec<String> = sql
        .split_whitespace()
        .take(6)
        .map(|w| w.split('(').next().unwrap_or_default().to_string())
        .collect();
    let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();

    let position = match upper.first().map(String::as_str) {
        Some("INSERT" | "REPLACE") => upper.iter().position(|w| w == "INTO").map(|i| i + 1),
        Some("DELETE") => upper.iter().position(|w| w == "FROM").map(|i| i + 1),
        Some("UPDATE") => match upper.get(1).map(String::as_str) {
            Some("OR") => Some(3),
            _ => Some(1),
        },
        _ => None,
    }?;

    words
        .get(position)
        .filter(|w| is_valid_identifier(w))
        .cloned()
}

/// A free-text log line for the batch log writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub source: String,
    pub level: String,
    pub message: String,
    /// Seconds since the Unix epoch.
    pub created_at: f64,
}

impl LogRecord {
    /// A record stamped with the current time.
    pub fn new(source: &str, level: &str, message: &str) -> Self {
        Self {
            source: source.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            created_at: now_millis() as f64 / 1000.0,
        }
    }
}
