//! The write coordinator: the single consumer of the priority channels.
//!
//! Each drain cycle empties critical, then priority, then takes a bounded
//! batch of normal so normal traffic cannot starve the next sweep. When all
//! three are empty the cycle blocks briefly on them instead of spinning.
//!
//! Contention is never surfaced to producers. The connection is released,
//! the loop backs off, and a copy of the message with `attempt + 1` goes
//! back onto its original channel. After `max_contention_retries` the
//! message is parked on the dead-letter channel instead.

pub mod stats;

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::message::{Priority, WriteMessage};
use crate::observability::metrics;
use crate::queue::{QueueError, WriteQueue, WriteReply};
use crate::sql::{TranslateError, Translator};
use crate::storage::{PoolError, StoreError, StorePool};

pub use stats::{StatsSnapshot, WriteStats};

/// Drain loop settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Normal messages executed per cycle.
    pub normal_batch_size: usize,
    /// How long an idle cycle blocks on the channels.
    pub poll_interval: Duration,
    /// Pool checkout timeout.
    pub acquire_timeout: Duration,
    /// Sleep before re-enqueueing after contention.
    pub contention_backoff: Duration,
    /// Requeues allowed before a message is dead-lettered.
    pub max_contention_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            normal_batch_size: 10,
            poll_interval: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(30),
            contention_backoff: Duration::from_millis(200),
            max_contention_retries: 1000,
        }
    }
}

/// Error executing one message.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecuteError {
    /// Whether the message should be requeued rather than dropped.
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Pool(e) => e.is_retryable(),
            Self::Store(e) => e.is_contention(),
            Self::Translate(_) => false,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::Pool(_) => "pool",
            Self::Translate(_) => "translate",
            Self::Store(_) => "execution",
        }
    }
}

/// Error that aborts a drain cycle.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("queue unavailable: {0}")]
    Queue(#[from] QueueError),
}

/// What happened to one popped message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written,
    Requeued,
    DeadLettered,
    Failed,
}

/// The drain loop and everything it needs.
pub struct WriteCoordinator {
    pool: Arc<dyn StorePool>,
    queue: WriteQueue,
    translator: Translator,
    config: CoordinatorConfig,
    stats: Arc<WriteStats>,
    stop: Arc<AtomicBool>,
}

impl WriteCoordinator {
    pub fn new(
        pool: Arc<dyn StorePool>,
        queue: WriteQueue,
        translator: Translator,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            translator,
            config,
            stats: Arc::new(WriteStats::new()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> Arc<WriteStats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Ask [`run`](Self::run) to return after the current message.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run one drain cycle. Returns the number of messages handled.
    pub fn drain_cycle(&self) -> Result<usize, CoordinatorError> {
        let mut handled = 0;

        for priority in [Priority::Critical, Priority::Priority] {
            while !self.stopping() {
                let Some(payload) = self.queue.pop(priority)? else {
                    break;
                };
                self.process_payload(priority, &payload);
                handled += 1;
            }
        }

        for _ in 0..self.config.normal_batch_size {
            if self.stopping() {
                break;
            }
            let Some(payload) = self.queue.pop(Priority::Normal)? else {
                break;
            };
            self.process_payload(Priority::Normal, &payload);
            handled += 1;
        }

        if handled == 0 && !self.stopping() {
            if let Some(popped) = self.queue.pop_any(self.config.poll_interval)? {
                self.process_payload(popped.priority, &popped.payload);
                handled += 1;
            }
        }

        Ok(handled)
    }

    /// Repeat [`drain_cycle`](Self::drain_cycle) until stopped.
    pub fn run(&self) {
        tracing::info!(
            backend = %self.pool.backend(),
            normal_batch_size = self.config.normal_batch_size,
            max_contention_retries = self.config.max_contention_retries,
            "Write coordinator started"
        );

        while !self.stopping() {
            if let Err(e) = self.drain_cycle() {
                tracing::error!(error = %e, "Drain cycle failed");
                thread::sleep(self.config.poll_interval);
            }
        }

        let totals = self.stats.snapshot();
        tracing::info!(
            processed = totals.processed,
            failed = totals.failed,
            requeued = totals.requeued,
            "Write coordinator stopped"
        );
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<CoordinatorHandle> {
        let stop = Arc::clone(&self.stop);
        let stats = Arc::clone(&self.stats);
        let thread = thread::Builder::new()
            .name("write-coordinator".to_string())
            .spawn(move || self.run())?;
        Ok(CoordinatorHandle {
            stop,
            stats,
            thread: Some(thread),
        })
    }

    /// Decode and execute one payload popped from `priority`.
    pub fn process_payload(&self, priority: Priority, payload: &str) -> Outcome {
        let msg = match WriteMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.record_failed();
                metrics::record_write_failed("unknown", "decode");
                tracing::error!(%priority, error = %e, "Dropping undecodable message");
                return Outcome::Failed;
            }
        };

        let started = Instant::now();
        match self.execute(&msg) {
            Ok(rows) => {
                self.stats.record_processed();
                metrics::record_write(
                    msg.table(),
                    msg.operation().as_str(),
                    priority.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                tracing::debug!(
                    message_id = %msg.message_id(),
                    table = %msg.table(),
                    operation = %msg.operation(),
                    rows,
                    queued_ms = crate::now_millis().saturating_sub(msg.enqueued_at()),
                    "Write committed"
                );
                self.reply(&msg, true);
                Outcome::Written
            }
            Err(e) if e.is_contention() => self.retry_later(&msg, payload, &e),
            Err(e) => {
                self.stats.record_failed();
                metrics::record_write_failed(msg.table(), e.reason());
                tracing::error!(
                    message_id = %msg.message_id(),
                    table = %msg.table(),
                    operation = %msg.operation(),
                    source_id = %msg.source_id(),
                    error = %e,
                    "Write failed"
                );
                self.reply(&msg, false);
                Outcome::Failed
            }
        }
    }

    /// Translate, borrow a connection, execute and commit.
    ///
    /// The connection is returned to the pool when this returns.
    fn execute(&self, msg: &WriteMessage) -> Result<u64, ExecuteError> {
        let statement = self.translator.translate(msg, Utc::now())?;
        let mut conn = self.pool.acquire(self.config.acquire_timeout)?;
        Ok(conn.execute(&statement)?)
    }

    fn retry_later(&self, msg: &WriteMessage, payload: &str, err: &ExecuteError) -> Outcome {
        if msg.attempt() >= self.config.max_contention_retries {
            self.stats.record_dead_lettered();
            metrics::record_write_failed(msg.table(), "retries_exhausted");
            tracing::error!(
                message_id = %msg.message_id(),
                table = %msg.table(),
                source_id = %msg.source_id(),
                attempts = msg.attempt(),
                error = %err,
                "Contention retries exhausted, dead-lettering"
            );
            if let Err(e) = self.queue.dead_letter(payload) {
                tracing::error!(message_id = %msg.message_id(), error = %e, "Dead-letter push failed");
            }
            self.reply(msg, false);
            return Outcome::DeadLettered;
        }

        thread::sleep(self.config.contention_backoff);

        let retry = msg.next_attempt();
        let requeued = retry
            .encode()
            .map_err(QueueError::from)
            .and_then(|encoded| self.queue.push_raw(retry.priority(), &encoded));
        match requeued {
            Ok(()) => {
                self.stats.record_requeued();
                metrics::record_requeue(msg.table(), msg.priority().as_str());
                tracing::warn!(
                    message_id = %msg.message_id(),
                    table = %msg.table(),
                    attempt = retry.attempt(),
                    error = %err,
                    "Contention, requeued"
                );
                Outcome::Requeued
            }
            Err(e) => {
                self.stats.record_failed();
                metrics::record_write_failed(msg.table(), "requeue");
                tracing::error!(
                    message_id = %msg.message_id(),
                    table = %msg.table(),
                    error = %e,
                    "Requeue failed, message lost"
                );
                self.reply(msg, false);
                Outcome::Failed
            }
        }
    }

    fn reply(&self, msg: &WriteMessage, success: bool) {
        let Some(key) = msg.callback_key() else {
            return;
        };
        let reply = WriteReply {
            success,
            message_id: msg.message_id().to_string(),
            operation: msg.operation(),
            table: msg.table().to_string(),
        };
        if let Err(e) = self.queue.send_reply(key, &reply) {
            tracing::warn!(message_id = %msg.message_id(), callback_key = key, error = %e, "Reply not delivered");
        }
    }
}

/// Handle on a coordinator running on its own thread.
pub struct CoordinatorHandle {
    stop: Arc<AtomicBool>,
    stats: Arc<WriteStats>,
    thread: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Signal the loop to stop. Does not wait.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the loop thread to exit.
    pub fn join(mut self) -> thread::Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> Arc<WriteStats> {
        Arc::clone(&self.stats)
    }
}
