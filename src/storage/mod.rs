//! Storage layer for Funnel.
//!
//! Provides:
//! - A bounded connection pool with overflow and recycling (SQLite)
//! - A pool delegating to r2d2 (PostgreSQL)
//! - One [`StorePool`] interface over both backends
//! - Contention classification for the retry paths

pub mod pool;
pub mod postgres;
pub mod schema;
pub mod sqlite;

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::sql::Statement;

pub use pool::{ConnectionPool, ManageConnection, PoolConfig, PooledConnection};

/// Which store engine is active for this deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Embedded single-file engine.
    Sqlite,
    /// Client/server engine.
    Postgres,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }

    /// Default number of base connections.
    ///
    /// Server-side pooling is cheaper, so PostgreSQL keeps fewer around.
    pub fn default_pool_size(self) -> usize {
        match self {
            Self::Sqlite => 10,
            Self::Postgres => 5,
        }
    }

    /// Default overflow cap.
    pub fn default_overflow(self) -> usize {
        match self {
            Self::Sqlite => 20,
            Self::Postgres => 10,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    #[error("connection pool is closed")]
    Closed,

    #[error("failed to open connection: {0}")]
    Connect(String),
}

impl PoolError {
    /// Whether the write should be requeued rather than dropped.
    ///
    /// Acquire timeouts come from the same transient pressure as lock
    /// contention. A closed pool only happens during shutdown, and a
    /// requeued message is picked up by the next run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Closed)
    }
}

/// Error type for statement execution.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was busy, locked or deadlocked.
    #[error("store contention: {0}")]
    Contention(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

impl StoreError {
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

/// Fallback contention check on driver messages.
pub(crate) fn is_contention_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["database is locked", "database is busy", "deadlock", "could not obtain lock"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// A borrowed connection able to run translated statements.
///
/// Dropping it returns the connection to its pool.
pub trait StoreConnection {
    /// Execute one statement in its own transaction and commit.
    ///
    /// Returns the number of affected rows.
    fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError>;
}

/// A bounded pool of store connections.
pub trait StorePool: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Borrow a connection, waiting at most `timeout`.
    fn acquire(&self, timeout: Duration) -> Result<Box<dyn StoreConnection + '_>, PoolError>;

    /// Current pool occupancy.
    fn state(&self) -> PoolState;

    /// Close every connection. Used at process shutdown.
    fn close_all(&self);
}

/// Pool occupancy at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolState {
    pub backend: BackendKind,
    pub base_size: usize,
    pub overflow_cap: usize,
    /// Connections currently borrowed.
    pub active: usize,
    /// Connections waiting in the pool.
    pub idle: usize,
    /// Live connections beyond the base size.
    pub overflow_active: usize,
    /// Replacement connections that could not be opened.
    pub recycle_failures: u64,
}

impl PoolState {
    pub fn capacity(&self) -> usize {
        self.base_size + self.overflow_cap
    }

    /// `(active + overflow_active) / (base_size + overflow_cap)`.
    pub fn utilization(&self) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        (self.active + self.overflow_active) as f64 / capacity as f64
    }

    pub fn health(&self) -> PoolHealth {
        PoolHealth::classify(self.utilization())
    }
}

/// Coarse pool pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Healthy,
    High,
    Critical,
}

impl PoolHealth {
    pub fn classify(utilization: f64) -> Self {
        if utilization < 0.60 {
            Self::Healthy
        } else if utilization < 0.85 {
            Self::High
        } else {
            Self::Critical
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}
