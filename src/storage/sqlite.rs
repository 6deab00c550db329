//! Embedded SQLite backend.
//!
//! Base connections are opened at startup, overflow lazily. Every
//! connection runs in WAL mode with a busy timeout, and each statement
//! executes in an `IMMEDIATE` transaction so lock contention surfaces at
//! `BEGIN` rather than halfway through a write.

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::pool::{ConnectionPool, ManageConnection, PoolConfig, PooledConnection};
use super::schema::apply_pragmas;
use super::{
    is_contention_message, BackendKind, PoolError, PoolState, StoreConnection, StoreError,
    StorePool,
};
use crate::sql::{format_sqlite_timestamp, SqlValue, Statement};

/// Opens SQLite connections with the write pragmas applied.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteManager {
    pub fn new<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ManageConnection for SqliteManager {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection, PoolError> {
        let conn = Connection::open(&self.path).map_err(|e| PoolError::Connect(e.to_string()))?;
        apply_pragmas(&conn, self.busy_timeout).map_err(|e| PoolError::Connect(e.to_string()))?;
        Ok(conn)
    }

    fn reset(&self, conn: &mut Connection) -> Result<(), StoreError> {
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK").map_err(classify_sqlite)?;
        }
        Ok(())
    }
}

/// Pool of SQLite connections.
pub type SqlitePool = ConnectionPool<SqliteManager>;

/// Open a SQLite pool, creating the database file if needed.
///
/// # Arguments
///
/// * `path` - Database file, or `:memory:`
/// * `config` - Base size, overflow cap and recycle age
/// * `busy_timeout` - SQLite busy handler timeout for each connection
///
/// # Errors
///
/// Returns [`PoolError::Connect`] if a base connection cannot be opened.
pub fn open_sqlite_pool<P: AsRef<Path>>(
    path: P,
    config: PoolConfig,
    busy_timeout: Duration,
) -> Result<SqlitePool, PoolError> {
    let manager = SqliteManager::new(path, busy_timeout);
    tracing::info!(
        path = %manager.path().display(),
        base_size = config.base_size,
        overflow_cap = config.overflow_cap,
        "Opening SQLite pool"
    );
    ConnectionPool::new(manager, config)
}

/// Map a rusqlite error onto the retry taxonomy.
pub fn classify_sqlite(err: rusqlite::Error) -> StoreError {
    let contention = match &err {
        rusqlite::Error::SqliteFailure(e, _) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        other => is_contention_message(&other.to_string()),
    };
    if contention {
        StoreError::Contention(err.to_string())
    } else {
        StoreError::Execution(err.to_string())
    }
}

impl StoreConnection for PooledConnection<'_, SqliteManager> {
    fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        let tx = self
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify_sqlite)?;
        let rows = tx
            .execute(&statement.sql, params_from_iter(statement.params.iter()))
            .map_err(classify_sqlite)?;
        tx.commit().map_err(classify_sqlite)?;
        Ok(rows as u64)
    }
}

impl StorePool for SqlitePool {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn acquire(&self, timeout: Duration) -> Result<Box<dyn StoreConnection + '_>, PoolError> {
        Ok(Box::new(ConnectionPool::acquire(self, timeout)?))
    }

    fn state(&self) -> PoolState {
        let (active, idle, overflow_active) = self.occupancy();
        PoolState {
            backend: BackendKind::Sqlite,
            base_size: self.config().base_size,
            overflow_cap: self.config().overflow_cap,
            active,
            idle,
            overflow_active,
            recycle_failures: self.recycle_failures(),
        }
    }

    fn close_all(&self) {
        ConnectionPool::close_all(self);
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Timestamp(at) => ToSqlOutput::Owned(Value::Text(format_sqlite_timestamp(*at))),
        })
    }
}
