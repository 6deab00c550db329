//! Bounded connection pool with overflow and recycling.
//!
//! A base set of connections is opened up front. When none is idle the pool
//! opens overflow connections up to a cap instead of waiting; once the cap
//! is reached, callers wait on a condition variable until the acquire
//! timeout expires.
//!
//! Invariant: `active + idle <= base_size + overflow_cap`, and no connection
//! older than `recycle_age` is ever handed out.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{PoolError, StoreError};

/// Opens and resets connections for a [`ConnectionPool`].
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Clear any uncommitted work before the connection goes back to idle.
    fn reset(&self, conn: &mut Self::Connection) -> Result<(), StoreError>;
}

/// Sizing and lifetime settings for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections opened at startup and kept idle.
    pub base_size: usize,
    /// Extra connections that may be opened under load.
    pub overflow_cap: usize,
    /// Maximum lifetime of a connection before it is replaced.
    pub recycle_age: Duration,
}

impl PoolConfig {
    pub fn capacity(&self) -> usize {
        self.base_size + self.overflow_cap
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_size: 10,
            overflow_cap: 20,
            recycle_age: Duration::from_secs(3600),
        }
    }
}

struct Timed<C> {
    conn: C,
    created_at: Instant,
}

impl<C> Timed<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            created_at: Instant::now(),
        }
    }
}

struct Slots<C> {
    idle: VecDeque<Timed<C>>,
    /// Open connections, borrowed or idle.
    live: usize,
    closed: bool,
}

/// Connection pool over any [`ManageConnection`].
pub struct ConnectionPool<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    slots: Mutex<Slots<M::Connection>>,
    available: Condvar,
    recycle_failures: AtomicU64,
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Create a pool and open its base connections.
    ///
    /// # Errors
    ///
    /// Returns an error if any base connection cannot be opened.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self, PoolError> {
        let mut idle = VecDeque::with_capacity(config.base_size);
        for _ in 0..config.base_size {
            idle.push_back(Timed::new(manager.connect()?));
        }

        tracing::debug!(
            base_size = config.base_size,
            overflow_cap = config.overflow_cap,
            recycle_age_secs = config.recycle_age.as_secs(),
            "Connection pool created"
        );

        Ok(Self {
            manager,
            config,
            slots: Mutex::new(Slots {
                live: idle.len(),
                idle,
                closed: false,
            }),
            available: Condvar::new(),
            recycle_failures: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Slots<M::Connection>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow a connection, waiting at most `timeout`.
    ///
    /// Idle connections are preferred. With none idle, an overflow
    /// connection is opened if the cap allows; otherwise the call waits for
    /// a release.
    ///
    /// # Errors
    ///
    /// * [`PoolError::Timeout`] - nothing was released within `timeout`
    /// * [`PoolError::Closed`] - [`close_all`](Self::close_all) has run
    /// * [`PoolError::Connect`] - opening an overflow connection failed
    pub fn acquire(&self, timeout: Duration) -> Result<PooledConnection<'_, M>, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.lock();

        loop {
            if slots.closed {
                return Err(PoolError::Closed);
            }

            if let Some(timed) = slots.idle.pop_front() {
                drop(slots);
                let timed = if timed.created_at.elapsed() > self.config.recycle_age {
                    drop(timed);
                    match self.reopen() {
                        Some(fresh) => fresh,
                        None => {
                            self.forget_slot();
                            return Err(PoolError::Connect(
                                "could not replace an expired connection".into(),
                            ));
                        }
                    }
                } else {
                    timed
                };
                return Ok(PooledConnection::new(self, timed));
            }

            if slots.live < self.config.capacity() {
                slots.live += 1;
                let overflow = slots.live > self.config.base_size;
                drop(slots);

                return match self.manager.connect() {
                    Ok(conn) => {
                        if overflow {
                            tracing::debug!("Opened overflow connection");
                        }
                        Ok(PooledConnection::new(self, Timed::new(conn)))
                    }
                    Err(e) => {
                        self.forget_slot();
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout(timeout));
            }
            let (guard, _) = self
                .available
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slots = guard;
        }
    }

    /// Return a connection to the pool.
    fn release(&self, mut timed: Timed<M::Connection>) {
        let timed = if timed.created_at.elapsed() > self.config.recycle_age {
            drop(timed);
            match self.reopen() {
                Some(fresh) => fresh,
                None => {
                    self.forget_slot();
                    return;
                }
            }
        } else if let Err(e) = self.manager.reset(&mut timed.conn) {
            tracing::warn!(error = %e, "Discarding connection that failed to roll back");
            drop(timed);
            self.forget_slot();
            return;
        } else {
            timed
        };

        let mut slots = self.lock();
        if slots.closed || slots.idle.len() >= self.config.base_size {
            slots.live -= 1;
            drop(slots);
            drop(timed);
        } else {
            slots.idle.push_back(timed);
            drop(slots);
        }
        self.available.notify_one();
    }

    /// Open a replacement for an expired connection, retrying once.
    fn reopen(&self) -> Option<Timed<M::Connection>> {
        match self.manager.connect() {
            Ok(conn) => return Some(Timed::new(conn)),
            Err(e) => tracing::warn!(error = %e, "Failed to recycle connection, retrying once"),
        }
        match self.manager.connect() {
            Ok(conn) => Some(Timed::new(conn)),
            Err(e) => {
                self.recycle_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Failed to recycle connection");
                None
            }
        }
    }

    /// Give up a slot whose connection is gone.
    fn forget_slot(&self) {
        let mut slots = self.lock();
        slots.live -= 1;
        drop(slots);
        self.available.notify_one();
    }

    /// Close every idle connection and refuse further acquires.
    ///
    /// Borrowed connections are closed when they come back.
    pub fn close_all(&self) {
        let mut slots = self.lock();
        slots.closed = true;
        let drained: Vec<_> = slots.idle.drain(..).collect();
        slots.live -= drained.len();
        drop(slots);
        self.available.notify_all();

        tracing::info!(closed = drained.len(), "Connection pool closed");
        drop(drained);
    }

    /// `(active, idle, overflow_active)` at this instant.
    pub fn occupancy(&self) -> (usize, usize, usize) {
        let slots = self.lock();
        let idle = slots.idle.len();
        (
            slots.live - idle,
            idle,
            slots.live.saturating_sub(self.config.base_size),
        )
    }

    pub fn recycle_failures(&self) -> u64 {
        self.recycle_failures.load(Ordering::Relaxed)
    }
}

/// A connection borrowed from a [`ConnectionPool`].
///
/// Returned to the pool exactly once, when dropped.
pub struct PooledConnection<'a, M: ManageConnection> {
    pool: &'a ConnectionPool<M>,
    conn: Option<Timed<M::Connection>>,
}

impl<'a, M: ManageConnection> PooledConnection<'a, M> {
    fn new(pool: &'a ConnectionPool<M>, timed: Timed<M::Connection>) -> Self {
        Self {
            pool,
            conn: Some(timed),
        }
    }

    /// Time since the underlying connection was opened.
    pub fn age(&self) -> Duration {
        self.conn
            .as_ref()
            .map_or(Duration::ZERO, |t| t.created_at.elapsed())
    }
}

impl<M: ManageConnection> Deref for PooledConnection<'_, M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        &self.conn.as_ref().expect("connection already released").conn
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<'_, M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        &mut self.conn.as_mut().expect("connection already released").conn
    }
}

impl<M: ManageConnection> Drop for PooledConnection<'_, M> {
    fn drop(&mut self) {
        if let Some(timed) = self.conn.take() {
            self.pool.release(timed);
        }
    }
}
