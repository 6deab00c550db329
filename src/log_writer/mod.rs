//! Batch log writer.
//!
//! A second consumer for high-volume, low-value log records. It blocks for
//! the first record, greedily drains more without blocking, and writes the
//! whole batch as one multi-row insert.
//!
//! Contention retries the whole batch with exponential backoff. When the
//! retries run out every payload goes back onto the log channel, since a
//! replayed log insert has no side effects.

pub mod batch;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::coordinator::ExecuteError;
use crate::observability::metrics;
use crate::queue::{QueueError, WriteQueue};
use crate::sql::{is_valid_identifier, Dialect, Statement, Translator, LOG_COLUMNS};
use crate::storage::StorePool;

pub use batch::{BatchLimits, LogBatch};

/// Default log table.
pub const DEFAULT_LOG_TABLE: &str = "agent_logs";

/// Bind variables SQLite accepts in one statement.
const SQLITE_MAX_VARIABLES: usize = 32_766;

/// Largest batch whose insert stays under [`SQLITE_MAX_VARIABLES`].
pub const MAX_LOG_BATCH_SIZE: usize = SQLITE_MAX_VARIABLES / LOG_COLUMNS.len();

/// Batch log writer settings.
#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    pub table: String,
    pub limits: BatchLimits,
    /// How long to block for the first record of a batch.
    pub first_wait: Duration,
    /// Delay before the first contention retry; doubles each retry.
    pub base_backoff: Duration,
    /// Contention retries before the batch is pushed back.
    pub max_retries: u32,
    pub acquire_timeout: Duration,
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_LOG_TABLE.to_string(),
            limits: BatchLimits::default(),
            first_wait: Duration::from_secs(5),
            base_backoff: Duration::from_millis(500),
            max_retries: 3,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl LogWriterConfig {
    /// Backoff before contention retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor)
    }
}

/// Error type for the log writer.
#[derive(Debug, Error)]
pub enum LogWriterError {
    #[error("invalid log table name: {0:?}")]
    InvalidTable(String),

    #[error("log batch size must be between 1 and {MAX_LOG_BATCH_SIZE}, got {0}")]
    BatchSize(usize),

    #[error("queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

/// Running totals for the log writer.
#[derive(Debug, Default)]
pub struct LogWriterStats {
    written: AtomicU64,
    batches: AtomicU64,
    pushed_back: AtomicU64,
    dropped: AtomicU64,
}

impl LogWriterStats {
    /// Records inserted.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// Batches committed.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Records returned to the channel after exhausting retries.
    pub fn pushed_back(&self) -> u64 {
        self.pushed_back.load(Ordering::SeqCst)
    }

    /// Records discarded as undecodable or by a failed batch.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// Create the log table if it does not exist.
pub fn ensure_log_table(
    pool: &dyn StorePool,
    dialect: &dyn Dialect,
    table: &str,
    acquire_timeout: Duration,
) -> Result<(), LogWriterError> {
    if !is_valid_identifier(table) {
        return Err(LogWriterError::InvalidTable(table.to_string()));
    }
    let statement = Statement {
        sql: dialect.create_log_table(table),
        params: Vec::new(),
    };
    let mut conn = pool
        .acquire(acquire_timeout)
        .map_err(ExecuteError::from)?;
    conn.execute(&statement).map_err(ExecuteError::from)?;
    tracing::info!(table, "Log table ready");
    Ok(())
}

/// The log drain loop.
pub struct BatchLogWriter {
    pool: Arc<dyn StorePool>,
    queue: WriteQueue,
    translator: Translator,
    config: LogWriterConfig,
    stats: Arc<LogWriterStats>,
    stop: Arc<AtomicBool>,
}

impl BatchLogWriter {
    /// # Errors
    ///
    /// Returns [`LogWriterError::InvalidTable`] for a bad table name and
    /// [`LogWriterError::BatchSize`] when `max_records` is 0 or above
    /// [`MAX_LOG_BATCH_SIZE`].
    pub fn new(
        pool: Arc<dyn StorePool>,
        queue: WriteQueue,
        translator: Translator,
        config: LogWriterConfig,
    ) -> Result<Self, LogWriterError> {
        if !is_valid_identifier(&config.table) {
            return Err(LogWriterError::InvalidTable(config.table));
        }
        let max_records = config.limits.max_records;
        if max_records == 0 || max_records > MAX_LOG_BATCH_SIZE {
            return Err(LogWriterError::BatchSize(max_records));
        }
        Ok(Self {
            pool,
            queue,
            translator,
            config,
            stats: Arc::new(LogWriterStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stats(&self) -> Arc<LogWriterStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Collect one batch and write it. Returns the number of records
    /// inserted.
    pub fn drain_once(&self) -> Result<usize, LogWriterError> {
        let Some(first) = self.queue.pop_log_wait(self.config.first_wait)? else {
            return Ok(0);
        };

        let mut batch = LogBatch::new(self.config.limits);
        if !batch.push(first) {
            while let Some(payload) = self.queue.pop_log()? {
                if batch.push(payload) {
                    break;
                }
            }
        }
        self.stats
            .dropped
            .fetch_add(batch.rejected() as u64, Ordering::SeqCst);

        if batch.is_empty() {
            return Ok(0);
        }
        self.write_batch(&batch)
    }

    fn write_batch(&self, batch: &LogBatch) -> Result<usize, LogWriterError> {
        let count = batch.len();
        let statement = match self
            .translator
            .translate_log_batch(&self.config.table, batch.records())
        {
            Ok(statement) => statement,
            Err(e) => {
                self.drop_batch(count, &ExecuteError::from(e));
                return Ok(0);
            }
        };

        let mut attempt = 0;
        loop {
            match self.execute(&statement) {
                Ok(_) => {
                    self.stats.written.fetch_add(count as u64, Ordering::SeqCst);
                    self.stats.batches.fetch_add(1, Ordering::SeqCst);
                    metrics::record_log_records(&self.config.table, count);
                    tracing::debug!(table = %self.config.table, count, "Log batch written");
                    return Ok(count);
                }
                Err(e) if e.is_contention() => {
                    attempt += 1;
                    if attempt > self.config.max_retries || self.stopping() {
                        self.queue.push_logs_back(batch.payloads())?;
                        self.stats
                            .pushed_back
                            .fetch_add(count as u64, Ordering::SeqCst);
                        tracing::warn!(
                            table = %self.config.table,
                            count,
                            error = %e,
                            "Log batch retries exhausted, pushed back"
                        );
                        return Ok(0);
                    }
                    let delay = self.config.backoff(attempt);
                    tracing::warn!(
                        table = %self.config.table,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Log batch contention, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(e) => {
                    self.drop_batch(count, &e);
                    return Ok(0);
                }
            }
        }
    }

    fn drop_batch(&self, count: usize, err: &ExecuteError) {
        self.stats.dropped.fetch_add(count as u64, Ordering::SeqCst);
        tracing::error!(
            table = %self.config.table,
            count,
            error = %err,
            "Log batch failed, dropped"
        );
    }

    fn execute(&self, statement: &Statement) -> Result<u64, ExecuteError> {
        let mut conn = self.pool.acquire(self.config.acquire_timeout)?;
        Ok(conn.execute(statement)?)
    }

    /// Repeat [`drain_once`](Self::drain_once) until stopped.
    pub fn run(&self) {
        tracing::info!(
            table = %self.config.table,
            max_records = self.config.limits.max_records,
            "Batch log writer started"
        );
        while !self.stopping() {
            if let Err(e) = self.drain_once() {
                tracing::error!(error = %e, "Log drain failed");
                thread::sleep(self.config.base_backoff);
            }
        }
        tracing::info!(
            written = self.stats.written(),
            dropped = self.stats.dropped(),
            "Batch log writer stopped"
        );
    }

    /// Run the loop on a dedicated thread.
    ///
    /// Shutdown takes effect after the current first-record wait.
    pub fn spawn(self) -> std::io::Result<LogWriterHandle> {
        let stop = Arc::clone(&self.stop);
        let stats = Arc::clone(&self.stats);
        let thread = thread::Builder::new()
            .name("batch-log-writer".to_string())
            .spawn(move || self.run())?;
        Ok(LogWriterHandle {
            stop,
            stats,
            thread: Some(thread),
        })
    }
}

/// Handle on a log writer running on its own thread.
pub struct LogWriterHandle {
    stop: Arc<AtomicBool>,
    stats: Arc<LogWriterStats>,
    thread: Option<JoinHandle<()>>,
}

impl LogWriterHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(mut self) -> thread::Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> Arc<LogWriterStats> {
        Arc::clone(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let config = LogWriterConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_millis(1000));
        assert_eq!(config.backoff(3), Duration::from_millis(2000));
    }

    fn memory_pool() -> Arc<dyn StorePool> {
        Arc::new(
            crate::storage::sqlite::open_sqlite_pool(
                ":memory:",
                crate::storage::PoolConfig {
                    base_size: 1,
                    overflow_cap: 0,
                    ..crate::storage::PoolConfig::default()
                },
                Duration::from_millis(100),
            )
            .unwrap(),
        )
    }

    fn build(config: LogWriterConfig) -> Result<BatchLogWriter, LogWriterError> {
        BatchLogWriter::new(
            memory_pool(),
            WriteQueue::in_memory("t"),
            Translator::new(Arc::new(crate::sql::SqliteDialect)),
            config,
        )
    }

    #[test]
    fn test_invalid_table_rejected() {
        let config = LogWriterConfig {
            table: "logs; DROP TABLE x".into(),
            ..LogWriterConfig::default()
        };
        assert!(matches!(build(config), Err(LogWriterError::InvalidTable(_))));
    }

    #[test]
    fn test_batch_size_bounded_by_bind_limit() {
        assert_eq!(MAX_LOG_BATCH_SIZE, 8191);

        let sized = |max_records| LogWriterConfig {
            limits: BatchLimits {
                max_records,
                ..BatchLimits::default()
            },
            ..LogWriterConfig::default()
        };
        assert!(matches!(build(sized(0)), Err(LogWriterError::BatchSize(0))));
        assert!(matches!(
            build(sized(MAX_LOG_BATCH_SIZE + 1)),
            Err(LogWriterError::BatchSize(8192))
        ));
        assert!(build(sized(MAX_LOG_BATCH_SIZE)).is_ok());
    }
}
