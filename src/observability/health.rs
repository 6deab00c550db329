//! Health snapshots of the pool, the queue and the coordinator.
//!
//! The reporter publishes a snapshot every interval: as a tracing event, as
//! metric gauges, and as JSON in the broker's health slot so any process on
//! the host can read it.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::metrics;
use crate::coordinator::WriteStats;
use crate::message::Priority;
use crate::queue::{QueueError, WriteQueue};
use crate::storage::{BackendKind, PoolHealth, StorePool};

/// Default publish interval.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Pool health is logged no more often than this.
pub const MIN_POOL_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Backlog classification by total pending messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Healthy,
    Backlog,
    Overloaded,
}

impl QueueStatus {
    pub fn classify(pending: usize) -> Self {
        match pending {
            0..=9 => Self::Healthy,
            10..=49 => Self::Backlog,
            _ => Self::Overloaded,
        }
    }
}

/// One health reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub backend: BackendKind,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub overflow_active: usize,
    pub overflow_cap: usize,
    pub queue_depth_critical: usize,
    pub queue_depth_priority: usize,
    pub queue_depth_normal: usize,
    pub processed_total: u64,
    pub failed_total: u64,
    pub status: QueueStatus,
    pub pool_health: PoolHealth,
    pub pool_utilization: f64,
    /// Unix milliseconds.
    pub timestamp: i64,
}

/// Builds and publishes [`HealthSnapshot`]s.
#[derive(Clone)]
pub struct HealthReporter {
    pool: Arc<dyn StorePool>,
    queue: WriteQueue,
    stats: Arc<WriteStats>,
    interval: Duration,
}

impl HealthReporter {
    pub fn new(
        pool: Arc<dyn StorePool>,
        queue: WriteQueue,
        stats: Arc<WriteStats>,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            stats,
            interval,
        }
    }

    /// Read the current state. Never blocks on the pool.
    pub fn snapshot(&self) -> Result<HealthSnapshot, QueueError> {
        let pool = self.pool.state();
        let depths = self.queue.depths()?;
        Ok(HealthSnapshot {
            backend: pool.backend,
            active_connections: pool.active,
            idle_connections: pool.idle,
            overflow_active: pool.overflow_active,
            overflow_cap: pool.overflow_cap,
            queue_depth_critical: depths.critical,
            queue_depth_priority: depths.priority,
            queue_depth_normal: depths.normal,
            processed_total: self.stats.processed(),
            failed_total: self.stats.failed(),
            status: QueueStatus::classify(depths.total()),
            pool_health: pool.health(),
            pool_utilization: pool.utilization(),
            timestamp: crate::now_millis(),
        })
    }

    /// Take a snapshot and publish it everywhere.
    pub fn publish(&self) -> Result<HealthSnapshot, QueueError> {
        let snapshot = self.snapshot()?;

        metrics::record_queue_depth(Priority::Critical.as_str(), snapshot.queue_depth_critical);
        metrics::record_queue_depth(Priority::Priority.as_str(), snapshot.queue_depth_priority);
        metrics::record_queue_depth(Priority::Normal.as_str(), snapshot.queue_depth_normal);
        metrics::record_pool_utilization(snapshot.backend.as_str(), snapshot.pool_utilization);

        let json = serde_json::to_string(&snapshot)?;
        self.queue.publish_health(&json, self.interval * 2)?;

        tracing::info!(
            backend = %snapshot.backend,
            active = snapshot.active_connections,
            idle = snapshot.idle_connections,
            overflow = snapshot.overflow_active,
            critical = snapshot.queue_depth_critical,
            priority = snapshot.queue_depth_priority,
            normal = snapshot.queue_depth_normal,
            processed = snapshot.processed_total,
            failed = snapshot.failed_total,
            status = ?snapshot.status,
            "Health"
        );
        Ok(snapshot)
    }

    /// Log the pool's pressure classification.
    pub fn log_pool_health(&self) {
        let state = self.pool.state();
        let health = state.health();
        let utilization = state.utilization();
        match health {
            PoolHealth::Healthy => tracing::info!(
                backend = %state.backend,
                utilization,
                health = health.as_str(),
                "Pool health"
            ),
            PoolHealth::High | PoolHealth::Critical => tracing::warn!(
                backend = %state.backend,
                utilization,
                health = health.as_str(),
                recycle_failures = state.recycle_failures,
                "Pool under pressure"
            ),
        }
    }

    /// Publish every interval until `shutdown_rx` changes.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let pool_log_interval = self.interval.max(MIN_POOL_LOG_INTERVAL);
        let mut last_pool_log: Option<Instant> = None;
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }

            // Broker reads may block on SQLite.
            let reporter = self.clone();
            match tokio::task::spawn_blocking(move || reporter.publish()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Health publish failed"),
                Err(e) => tracing::warn!(error = %e, "Health task panicked"),
            }

            if last_pool_log.map_or(true, |at| at.elapsed() >= pool_log_interval) {
                self.log_pool_health();
                last_pool_log = Some(Instant::now());
            }
        }

        tracing::debug!("Health reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{row, Params};
    use crate::storage::{PoolConfig, PoolState};

    #[test]
    fn test_queue_status_thresholds() {
        assert_eq!(QueueStatus::classify(0), QueueStatus::Healthy);
        assert_eq!(QueueStatus::classify(9), QueueStatus::Healthy);
        assert_eq!(QueueStatus::classify(10), QueueStatus::Backlog);
        assert_eq!(QueueStatus::classify(49), QueueStatus::Backlog);
        assert_eq!(QueueStatus::classify(50), QueueStatus::Overloaded);
    }

    fn reporter(queue: WriteQueue) -> HealthReporter {
        let pool = crate::storage::sqlite::open_sqlite_pool(
            ":memory:",
            PoolConfig {
                base_size: 2,
                overflow_cap: 2,
                ..PoolConfig::default()
            },
            Duration::from_millis(100),
        )
        .unwrap();
        HealthReporter::new(
            Arc::new(pool),
            queue,
            Arc::new(WriteStats::new()),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_snapshot_reflects_queue_and_pool() {
        let queue = WriteQueue::in_memory("t");
        for _ in 0..12 {
            queue
                .enqueue_insert("agents", row([("name", "X")]), "a", Priority::Normal)
                .unwrap();
        }
        queue
            .enqueue_execute("DELETE FROM agents", Params::default(), "a", Priority::Critical)
            .unwrap();

        let snapshot = reporter(queue).snapshot().unwrap();
        assert_eq!(snapshot.backend, BackendKind::Sqlite);
        assert_eq!(snapshot.idle_connections, 2);
        assert_eq!(snapshot.overflow_cap, 2);
        assert_eq!(snapshot.queue_depth_normal, 12);
        assert_eq!(snapshot.queue_depth_critical, 1);
        assert_eq!(snapshot.status, QueueStatus::Backlog);
        assert_eq!(snapshot.pool_health, PoolHealth::Healthy);
    }

    #[test]
    fn test_publish_writes_health_slot() {
        let queue = WriteQueue::in_memory("t");
        let reporter = reporter(queue.clone());
        reporter.publish().unwrap();

        let json = queue.read_health().unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["backend"], "sqlite");
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["processed_total"], 0);
    }

    #[test]
    fn test_pool_health_in_snapshot_json() {
        let state = PoolState {
            backend: BackendKind::Postgres,
            base_size: 5,
            overflow_cap: 10,
            active: 7,
            idle: 0,
            overflow_active: 2,
            recycle_failures: 0,
        };
        assert_eq!(state.health(), PoolHealth::High);
        assert_eq!(serde_json::to_value(state.health()).unwrap(), "high");
    }
}
