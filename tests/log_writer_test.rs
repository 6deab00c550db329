//! Batch log writer integration tests.

mod common;

use common::{wait_for, RecordingPool, TestFixture};
use funnel::log_writer::{ensure_log_table, BatchLimits, BatchLogWriter, LogWriterConfig};
use funnel::message::LogRecord;
use funnel::queue::WriteQueue;
use funnel::sql::{dialect_for, SqliteDialect, Translator};
use funnel::storage::{BackendKind, StorePool};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> LogWriterConfig {
    LogWriterConfig {
        first_wait: Duration::from_millis(20),
        base_backoff: Duration::from_millis(1),
        acquire_timeout: Duration::from_secs(1),
        ..LogWriterConfig::default()
    }
}

fn writer(pool: Arc<dyn StorePool>, queue: &WriteQueue, config: LogWriterConfig) -> BatchLogWriter {
    BatchLogWriter::new(
        pool,
        queue.clone(),
        Translator::new(dialect_for(BackendKind::Sqlite)),
        config,
    )
    .unwrap()
}

fn enqueue_logs(queue: &WriteQueue, count: usize) {
    for i in 0..count {
        queue
            .enqueue_log(&LogRecord::new("agent-1", "INFO", &format!("line {i}")))
            .unwrap();
    }
}

#[test]
fn test_batches_written_to_sqlite() {
    let fixture = TestFixture::new();
    let pool: Arc<dyn StorePool> = Arc::new(fixture.sqlite_pool(1, 1));
    ensure_log_table(pool.as_ref(), &SqliteDialect, "agent_logs", Duration::from_secs(1)).unwrap();

    let queue = WriteQueue::in_memory("test");
    enqueue_logs(&queue, 250);

    let writer = writer(pool, &queue, fast_config());
    assert_eq!(writer.drain_once().unwrap(), 100);
    assert_eq!(writer.drain_once().unwrap(), 100);
    assert_eq!(writer.drain_once().unwrap(), 50);
    assert_eq!(writer.drain_once().unwrap(), 0);

    let stats = writer.stats();
    assert_eq!(stats.written(), 250);
    assert_eq!(stats.batches(), 3);
    assert_eq!(fixture.count("agent_logs"), 250);

    let (first, created_at): (String, String) = fixture
        .connection()
        .query_row(
            "SELECT message, created_at FROM agent_logs ORDER BY id LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(first, "line 0");
    assert_eq!(created_at.len(), 26);
}

#[test]
fn test_small_batch_limit() {
    let pool = Arc::new(RecordingPool::new());
    let queue = WriteQueue::in_memory("test");
    enqueue_logs(&queue, 5);

    let config = LogWriterConfig {
        limits: BatchLimits {
            max_records: 2,
            ..BatchLimits::default()
        },
        ..fast_config()
    };
    let writer = writer(pool.clone(), &queue, config);

    assert_eq!(writer.drain_once().unwrap(), 2);
    assert_eq!(queue.log_depth().unwrap(), 3);
    assert_eq!(pool.executed()[0].params.len(), 8);
}

#[test]
fn test_contention_pushes_batch_back() {
    let pool = Arc::new(RecordingPool::new());
    // Two exhausted rounds of four attempts, then two more failures.
    pool.script_contention("agent_logs", 10);
    let queue = WriteQueue::in_memory("test");
    enqueue_logs(&queue, 5);

    let writer = writer(pool.clone(), &queue, fast_config());
    let stats = writer.stats();

    assert_eq!(writer.drain_once().unwrap(), 0);
    assert_eq!(stats.pushed_back(), 5);
    assert_eq!(queue.log_depth().unwrap(), 5);

    assert_eq!(writer.drain_once().unwrap(), 0);
    assert_eq!(stats.pushed_back(), 10);

    assert_eq!(writer.drain_once().unwrap(), 5);
    assert_eq!(stats.written(), 5);
    assert_eq!(stats.dropped(), 0);
    assert_eq!(queue.log_depth().unwrap(), 0);
    assert_eq!(pool.released(), pool.acquired());
}

#[test]
fn test_undecodable_records_dropped() {
    let pool = Arc::new(RecordingPool::new());
    let queue = WriteQueue::in_memory("test");
    enqueue_logs(&queue, 1);
    queue.push_logs_back(&["not json".to_string()]).unwrap();
    enqueue_logs(&queue, 1);

    let writer = writer(pool.clone(), &queue, fast_config());
    assert_eq!(writer.drain_once().unwrap(), 2);

    let stats = writer.stats();
    assert_eq!(stats.written(), 2);
    assert_eq!(stats.dropped(), 1);
    assert_eq!(pool.executed().len(), 1);
}

#[test]
fn test_bad_timestamp_does_not_sink_batch() {
    let fixture = TestFixture::new();
    let pool: Arc<dyn StorePool> = Arc::new(fixture.sqlite_pool(1, 1));
    ensure_log_table(pool.as_ref(), &SqliteDialect, "agent_logs", Duration::from_secs(1)).unwrap();

    let queue = WriteQueue::in_memory("test");
    enqueue_logs(&queue, 5);
    let mut bad = LogRecord::new("agent-1", "INFO", "far future");
    bad.created_at = 1e18;
    queue.enqueue_log(&bad).unwrap();
    enqueue_logs(&queue, 4);

    let writer = writer(pool, &queue, fast_config());
    assert_eq!(writer.drain_once().unwrap(), 9);

    let stats = writer.stats();
    assert_eq!(stats.written(), 9);
    assert_eq!(stats.dropped(), 1);
    assert_eq!(fixture.count("agent_logs"), 9);
}

#[test]
fn test_execution_error_drops_batch() {
    let fixture = TestFixture::new();
    let pool: Arc<dyn StorePool> = Arc::new(fixture.sqlite_pool(1, 1));
    // No log table, so the insert fails outright.
    let queue = WriteQueue::in_memory("test");
    enqueue_logs(&queue, 3);

    let writer = writer(pool, &queue, fast_config());
    assert_eq!(writer.drain_once().unwrap(), 0);

    let stats = writer.stats();
    assert_eq!(stats.dropped(), 3);
    assert_eq!(stats.pushed_back(), 0);
    assert_eq!(queue.log_depth().unwrap(), 0);
}

#[test]
fn test_spawned_writer_drains_and_stops() {
    let fixture = TestFixture::new();
    let pool: Arc<dyn StorePool> = Arc::new(fixture.sqlite_pool(1, 1));
    ensure_log_table(pool.as_ref(), &SqliteDialect, "agent_logs", Duration::from_secs(1)).unwrap();
    let queue = WriteQueue::in_memory("test");

    let handle = writer(pool, &queue, fast_config()).spawn().unwrap();
    enqueue_logs(&queue, 30);

    let stats = handle.stats();
    assert!(wait_for(Duration::from_secs(5), || stats.written() == 30));

    handle.shutdown();
    handle.join().unwrap();
    assert_eq!(fixture.count("agent_logs"), 30);
}
