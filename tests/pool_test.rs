//! Connection pool integration tests against real SQLite files.

mod common;

use common::TestFixture;
use funnel::sql::{SqlValue, Statement};
use funnel::storage::sqlite::open_sqlite_pool;
use funnel::storage::{PoolConfig, PoolError, StorePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn insert(name: String) -> Statement {
    Statement {
        sql: "INSERT INTO agents (name) VALUES (?)".into(),
        params: vec![SqlValue::Text(name)],
    }
}

#[test]
fn test_capacity_holds_under_concurrent_writers() {
    let fixture = TestFixture::new();
    fixture.create_agents_table();
    let pool = Arc::new(open_sqlite_pool(
        &fixture.db_path,
        PoolConfig {
            base_size: 2,
            overflow_cap: 2,
            ..PoolConfig::default()
        },
        Duration::from_secs(5),
    )
    .unwrap());

    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let pool = Arc::clone(&pool);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut max_seen = 0;
            while !done.load(Ordering::SeqCst) {
                let state = StorePool::state(pool.as_ref());
                assert!(state.active + state.idle <= state.capacity());
                assert!(state.overflow_active <= state.overflow_cap);
                max_seen = max_seen.max(state.active);
                thread::sleep(Duration::from_millis(1));
            }
            max_seen
        })
    };

    let writers: Vec<_> = (0..8)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for i in 0..25 {
                    let mut conn = StorePool::acquire(pool.as_ref(), Duration::from_secs(10)).unwrap();
                    conn.execute(&insert(format!("agent-{t}-{i}"))).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    let max_active = sampler.join().unwrap();

    assert!(max_active <= 4);
    assert_eq!(fixture.count("agents"), 200);

    let state = StorePool::state(pool.as_ref());
    assert_eq!(state.active, 0);
    assert!(state.idle <= 2);
}

#[test]
fn test_exhausted_pool_times_out() {
    let fixture = TestFixture::new();
    let pool = fixture.sqlite_pool(1, 1);

    let _a = StorePool::acquire(&pool, Duration::from_millis(10)).unwrap();
    let _b = StorePool::acquire(&pool, Duration::from_millis(10)).unwrap();
    assert_eq!(StorePool::state(&pool).overflow_active, 1);

    match StorePool::acquire(&pool, Duration::from_millis(30)) {
        Err(e @ PoolError::Timeout(_)) => assert!(e.is_retryable()),
        Err(other) => panic!("expected timeout, got {other}"),
        Ok(_) => panic!("expected timeout, got a connection"),
    };
}

#[test]
fn test_expired_connections_are_recycled() {
    let fixture = TestFixture::new();
    let recycle_age = Duration::from_millis(50);
    let pool = open_sqlite_pool(
        &fixture.db_path,
        PoolConfig {
            base_size: 1,
            overflow_cap: 0,
            recycle_age,
        },
        Duration::from_millis(50),
    )
    .unwrap();

    thread::sleep(recycle_age * 2);
    {
        let conn = pool.acquire(Duration::from_secs(1)).unwrap();
        assert!(conn.age() < recycle_age);
        thread::sleep(recycle_age * 2);
    }

    let conn = pool.acquire(Duration::from_secs(1)).unwrap();
    assert!(conn.age() < recycle_age);
    assert_eq!(pool.recycle_failures(), 0);
}

#[test]
fn test_closed_pool_rejects_acquire() {
    let fixture = TestFixture::new();
    let pool = fixture.sqlite_pool(2, 0);

    StorePool::close_all(&pool);
    assert!(matches!(
        StorePool::acquire(&pool, Duration::from_millis(10)),
        Err(PoolError::Closed)
    ));
    assert_eq!(StorePool::state(&pool).idle, 0);
}
