//! Test utilities for Funnel integration tests.
//!
//! Provides:
//! - Temporary database fixtures
//! - A recording pool that scripts contention and counts releases
//! - Polling helpers

#![allow(dead_code)]

use funnel::sql::Statement;
use funnel::storage::sqlite::{open_sqlite_pool, SqlitePool};
use funnel::storage::{
    BackendKind, PoolConfig, PoolError, PoolState, StoreConnection, StoreError, StorePool,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    pub temp_dir: TempDir,
    /// Path to the store database
    pub db_path: PathBuf,
    /// Path to the broker database
    pub broker_path: PathBuf,
}

impl TestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("store.db");
        let broker_path = temp_dir.path().join("broker.db");
        Self {
            temp_dir,
            db_path,
            broker_path,
        }
    }

    /// Open a small SQLite pool on the fixture database.
    pub fn sqlite_pool(&self, base_size: usize, overflow_cap: usize) -> SqlitePool {
        open_sqlite_pool(
            &self.db_path,
            PoolConfig {
                base_size,
                overflow_cap,
                ..PoolConfig::default()
            },
            Duration::from_millis(50),
        )
        .expect("failed to open pool")
    }

    /// A direct connection for setup and assertions.
    pub fn connection(&self) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(&self.db_path).expect("failed to open db");
        conn.busy_timeout(Duration::from_secs(5))
            .expect("failed to set busy timeout");
        conn
    }

    /// Create the `agents` table used by most scenarios.
    pub fn create_agents_table(&self) {
        self.connection()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS agents (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 name TEXT NOT NULL UNIQUE, \
                 status TEXT, \
                 last_seen TEXT)",
            )
            .expect("failed to create agents table");
    }

    pub fn count(&self, table: &str) -> i64 {
        self.connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("count failed")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A pool that records statements instead of running them.
///
/// Statements whose SQL mentions a scripted table fail with contention
/// that many times before succeeding.
#[derive(Default)]
pub struct RecordingPool {
    executed: Mutex<Vec<Statement>>,
    contention: Mutex<HashMap<String, usize>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl RecordingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail statements touching `table` with contention `times` times.
    pub fn script_contention(&self, table: &str, times: usize) {
        self.contention
            .lock()
            .unwrap()
            .insert(table.to_string(), times);
    }

    pub fn executed(&self) -> Vec<Statement> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed().into_iter().map(|s| s.sql).collect()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct RecordingConnection<'a> {
    pool: &'a RecordingPool,
}

impl StoreConnection for RecordingConnection<'_> {
    fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        {
            let mut contention = self.pool.contention.lock().unwrap();
            for (table, left) in contention.iter_mut() {
                if *left > 0 && statement.sql.contains(table.as_str()) {
                    *left -= 1;
                    return Err(StoreError::Contention("database is locked".into()));
                }
            }
        }
        if statement.sql.contains("no_such_table") {
            return Err(StoreError::Execution("no such table: no_such_table".into()));
        }
        self.pool.executed.lock().unwrap().push(statement.clone());
        Ok(1)
    }
}

impl Drop for RecordingConnection<'_> {
    fn drop(&mut self) {
        self.pool.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl StorePool for RecordingPool {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn acquire(&self, _timeout: Duration) -> Result<Box<dyn StoreConnection + '_>, PoolError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConnection { pool: self }))
    }

    fn state(&self) -> PoolState {
        let active = self.acquired().saturating_sub(self.released());
        PoolState {
            backend: BackendKind::Sqlite,
            base_size: 1,
            overflow_cap: 0,
            active,
            idle: 1 - active.min(1),
            overflow_active: 0,
            recycle_failures: 0,
        }
    }

    fn close_all(&self) {}
}

/// Poll `condition` every 10ms until it holds or `timeout` expires.
pub fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
