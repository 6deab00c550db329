//! Backend SQL dialects.
//!
//! One [`Dialect`] is chosen at startup with [`dialect_for`] and shared by
//! everything that builds statements. Identifiers are validated before they
//! reach a dialect, so they are emitted unquoted.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use super::{format_sqlite_timestamp, SqlValue};
use crate::storage::BackendKind;

/// Syntax and value conventions of one backend.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn backend(&self) -> BackendKind;

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// The backend's native representation of a timestamp.
    fn timestamp(&self, at: DateTime<Utc>) -> SqlValue;

    /// The `ON CONFLICT ...` clause appended to an insert.
    fn upsert_clause(&self, conflict_key: &[&str], update_columns: &[&str]) -> String;

    /// DDL for the batch log table.
    fn create_log_table(&self, table: &str) -> String;

    /// `(p1, p2, ...)` for `count` parameters starting after `offset`.
    fn value_tuple(&self, offset: usize, count: usize) -> String {
        let slots: Vec<String> = (1..=count).map(|i| self.placeholder(offset + i)).collect();
        format!("({})", slots.join(", "))
    }

    fn insert(&self, table: &str, columns: &[&str]) -> String {
        self.multi_row_insert(table, columns, 1)
    }

    /// Insert-or-update on `conflict_key`.
    fn upsert(&self, table: &str, columns: &[&str], conflict_key: &[&str]) -> String {
        let update_columns: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !conflict_key.contains(c))
            .collect();
        format!(
            "{} {}",
            self.insert(table, columns),
            self.upsert_clause(conflict_key, &update_columns)
        )
    }

    /// `UPDATE` with equality conditions on `filter_columns`, bound after
    /// the `set_columns`.
    fn update(&self, table: &str, set_columns: &[&str], filter_columns: &[&str]) -> String {
        let assignments: Vec<String> = set_columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = {}", self.placeholder(i + 1)))
            .collect();
        let conditions: Vec<String> = filter_columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = {}", self.placeholder(set_columns.len() + i + 1)))
            .collect();
        format!(
            "UPDATE {table} SET {} WHERE {}",
            assignments.join(", "),
            conditions.join(" AND ")
        )
    }

    fn multi_row_insert(&self, table: &str, columns: &[&str], rows: usize) -> String {
        let tuples: Vec<String> = (0..rows)
            .map(|r| self.value_tuple(r * columns.len(), columns.len()))
            .collect();
        format!(
            "INSERT INTO {table} ({}) VALUES {}",
            columns.join(", "),
            tuples.join(", ")
        )
    }
}

/// Embedded SQLite: `?` placeholders, timestamps as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn timestamp(&self, at: DateTime<Utc>) -> SqlValue {
        SqlValue::Text(format_sqlite_timestamp(at))
    }

    fn upsert_clause(&self, conflict_key: &[&str], update_columns: &[&str]) -> String {
        let target = conflict_key.join(", ");
        if update_columns.is_empty() {
            return format!("ON CONFLICT({target}) DO NOTHING");
        }
        let assignments: Vec<String> = update_columns
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        format!("ON CONFLICT({target}) DO UPDATE SET {}", assignments.join(", "))
    }

    fn create_log_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             source TEXT NOT NULL, \
             level TEXT NOT NULL, \
             message TEXT NOT NULL, \
             created_at TEXT NOT NULL)"
        )
    }
}

/// PostgreSQL: `$n` placeholders, timestamps bound as `TIMESTAMPTZ`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn timestamp(&self, at: DateTime<Utc>) -> SqlValue {
        SqlValue::Timestamp(at)
    }

    fn upsert_clause(&self, conflict_key: &[&str], update_columns: &[&str]) -> String {
        let target = conflict_key.join(", ");
        if update_columns.is_empty() {
            return format!("ON CONFLICT ({target}) DO NOTHING");
        }
        let assignments: Vec<String> = update_columns
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        format!("ON CONFLICT ({target}) DO UPDATE SET {}", assignments.join(", "))
    }

    fn create_log_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id BIGSERIAL PRIMARY KEY, \
             source TEXT NOT NULL, \
             level TEXT NOT NULL, \
             message TEXT NOT NULL, \
             created_at TIMESTAMPTZ NOT NULL)"
        )
    }
}

/// The dialect for `backend`.
pub fn dialect_for(backend: BackendKind) -> Arc<dyn Dialect> {
    match backend {
        BackendKind::Sqlite => Arc::new(SqliteDialect),
        BackendKind::Postgres => Arc::new(PostgresDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert() {
        assert_eq!(
            SqliteDialect.insert("agents", &["name", "status"]),
            "INSERT INTO agents (name, status) VALUES (?, ?)"
        );
        assert_eq!(
            PostgresDialect.insert("agents", &["name", "status"]),
            "INSERT INTO agents (name, status) VALUES ($1, $2)"
        );
    }

    #[test]
    fn test_upsert_differs_per_backend() {
        let cols = ["name", "status", "updated_at"];
        assert_eq!(
            SqliteDialect.upsert("agents", &cols, &["name"]),
            "INSERT INTO agents (name, status, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at"
        );
        assert_eq!(
            PostgresDialect.upsert("agents", &cols, &["name"]),
            "INSERT INTO agents (name, status, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at"
        );
    }

    #[test]
    fn test_upsert_with_only_key_columns_does_nothing() {
        assert_eq!(
            PostgresDialect.upsert("seen", &["id"], &["id"]),
            "INSERT INTO seen (id) VALUES ($1) ON CONFLICT (id) DO NOTHING"
        );
    }

    #[test]
    fn test_update_numbers_filter_after_assignments() {
        assert_eq!(
            PostgresDialect.update("agents", &["status", "score"], &["name"]),
            "UPDATE agents SET status = $1, score = $2 WHERE name = $3"
        );
        assert_eq!(
            SqliteDialect.update("agents", &["status"], &["name", "team"]),
            "UPDATE agents SET status = ? WHERE name = ? AND team = ?"
        );
    }

    #[test]
    fn test_multi_row_insert() {
        assert_eq!(
            PostgresDialect.multi_row_insert("logs", &["a", "b"], 2),
            "INSERT INTO logs (a, b) VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(
            SqliteDialect.multi_row_insert("logs", &["a"], 3),
            "INSERT INTO logs (a) VALUES (?), (?), (?)"
        );
    }

    #[test]
    fn test_dialect_for_backend() {
        assert_eq!(dialect_for(BackendKind::Sqlite).backend(), BackendKind::Sqlite);
        assert_eq!(dialect_for(BackendKind::Postgres).backend(), BackendKind::Postgres);
    }
}
