//! Broker hosted in a shared SQLite file.
//!
//! Any process on the host that can open the file can enqueue. Pops are a
//! single `DELETE ... RETURNING`, so two consumers never receive the same
//! payload.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use super::broker::{Broker, BrokerError};
use crate::now_millis;
use crate::storage::schema::{apply_broker_pragmas, initialize_broker_schema};

/// Default sleep between polls in [`Broker::pop_wait`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A [`Broker`] backed by an SQLite file.
#[derive(Clone)]
pub struct SqliteBroker {
    pool: Pool<SqliteConnectionManager>,
    poll_interval: Duration,
}

impl SqliteBroker {
    /// Open (or create) the broker file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or the broker tables
    /// cannot be initialized.
    pub fn open<P: AsRef<Path>>(path: P, max_size: u32) -> Result<Self, BrokerError> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_customizer(Box::new(BrokerConnectionCustomizer))
            .build(manager)?;

        initialize_broker_schema(&*pool.get()?)?;
        tracing::info!(path = %path.as_ref().display(), "Opened SQLite broker");

        Ok(Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl Broker for SqliteBroker {
    fn push(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO broker_queue (channel, payload) VALUES (?1, ?2)",
            (channel, payload),
        )?;
        Ok(())
    }

    fn pop(&self, channel: &str) -> Result<Option<String>, BrokerError> {
        let conn = self.pool.get()?;
        let payload = conn
            .query_row(
                r#"
                DELETE FROM broker_queue
                WHERE id = (
                    SELECT id FROM broker_queue WHERE channel = ?1 ORDER BY id LIMIT 1
                )
                RETURNING payload
                "#,
                [channel],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload)
    }

    fn pop_wait(
        &self,
        channels: &[&str],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            for channel in channels {
                if let Some(payload) = self.pop(channel)? {
                    return Ok(Some(((*channel).to_string(), payload)));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn len(&self, channel: &str) -> Result<usize, BrokerError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM broker_queue WHERE channel = ?1",
            [channel],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn set_slot(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let conn = self.pool.get()?;
        let now = now_millis();
        conn.execute("DELETE FROM broker_slots WHERE expires_at <= ?1", [now])?;
        conn.execute(
            r#"
            INSERT INTO broker_slots (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
            (key, value, now.saturating_add(ttl_millis(ttl))),
        )?;
        Ok(())
    }

    fn take_slot(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "DELETE FROM broker_slots WHERE key = ?1 AND expires_at > ?2 RETURNING value",
                (key, now_millis()),
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn get_slot(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM broker_slots WHERE key = ?1 AND expires_at > ?2",
                (key, now_millis()),
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

/// Connection customizer that applies broker pragmas.
#[derive(Debug)]
struct BrokerConnectionCustomizer;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error>
    for BrokerConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        apply_broker_pragmas(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn broker(temp_dir: &TempDir) -> SqliteBroker {
        SqliteBroker::open(temp_dir.path().join("broker.db"), 4)
            .unwrap()
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_fifo_and_len() {
        let temp_dir = TempDir::new().unwrap();
        let broker = broker(&temp_dir);

        broker.push("q:normal", "a").unwrap();
        broker.push("q:critical", "c").unwrap();
        broker.push("q:normal", "b").unwrap();

        assert_eq!(broker.len("q:normal").unwrap(), 2);
        assert_eq!(broker.pop("q:normal").unwrap().as_deref(), Some("a"));
        assert_eq!(broker.pop("q:normal").unwrap().as_deref(), Some("b"));
        assert_eq!(broker.pop("q:normal").unwrap(), None);
        assert_eq!(broker.len("q:critical").unwrap(), 1);
    }

    #[test]
    fn test_pop_wait_order_and_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let broker = broker(&temp_dir);

        broker.push("low", "l").unwrap();
        broker.push("high", "h").unwrap();
        let got = broker
            .pop_wait(&["high", "low"], Duration::from_millis(20))
            .unwrap();
        assert_eq!(got, Some(("high".to_string(), "h".to_string())));

        broker.pop("low").unwrap();
        let got = broker.pop_wait(&["high", "low"], Duration::from_millis(20)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_shared_between_handles() {
        let temp_dir = TempDir::new().unwrap();
        let producer = broker(&temp_dir);
        let consumer = broker(&temp_dir);

        producer.push("q", "hello").unwrap();
        assert_eq!(consumer.pop("q").unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn test_concurrent_pops_never_duplicate() {
        let temp_dir = TempDir::new().unwrap();
        let broker = Arc::new(broker(&temp_dir));
        for i in 0..100 {
            broker.push("q", &i.to_string()).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let broker = Arc::clone(&broker);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(p) = broker.pop("q").unwrap() {
                        got.push(p);
                    }
                    got
                })
            })
            .collect();

        let all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(all.len(), 100);
        assert_eq!(unique.len(), 100);
    }

    #[test]
    fn test_slots() {
        let temp_dir = TempDir::new().unwrap();
        let broker = broker(&temp_dir);

        broker.set_slot("k", "v1", Duration::from_secs(30)).unwrap();
        broker.set_slot("k", "v2", Duration::from_secs(30)).unwrap();
        assert_eq!(broker.get_slot("k").unwrap().as_deref(), Some("v2"));
        assert_eq!(broker.take_slot("k").unwrap().as_deref(), Some("v2"));
        assert_eq!(broker.take_slot("k").unwrap(), None);

        broker.set_slot("gone", "v", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(broker.take_slot("gone").unwrap(), None);
    }
}
