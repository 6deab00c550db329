//! Broker abstraction and the in-process broker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Broker database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Named FIFO channels plus expiring key/value slots.
///
/// Delivery is best effort: nothing here promises that queued payloads
/// survive a broker restart.
pub trait Broker: Send + Sync {
    /// Append `payload` to the tail of `channel`.
    fn push(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Pop the head of `channel` without waiting.
    fn pop(&self, channel: &str) -> Result<Option<String>, BrokerError>;

    /// Pop the head of the first non-empty channel in `channels`, waiting
    /// up to `timeout` for one to receive a payload.
    ///
    /// Returns the channel name with the payload.
    fn pop_wait(
        &self,
        channels: &[&str],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, BrokerError>;

    fn len(&self, channel: &str) -> Result<usize, BrokerError>;

    /// Store `value` under `key` until `ttl` elapses.
    fn set_slot(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Read and delete the slot at `key`.
    fn take_slot(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Read the slot at `key` without consuming it.
    fn get_slot(&self, key: &str) -> Result<Option<String>, BrokerError>;
}

#[derive(Default)]
struct MemoryState {
    channels: HashMap<String, VecDeque<String>>,
    slots: HashMap<String, (String, Instant)>,
}

impl MemoryState {
    fn pop_first(&mut self, channels: &[&str]) -> Option<(String, String)> {
        channels.iter().find_map(|channel| {
            self.channels
                .get_mut(*channel)
                .and_then(VecDeque::pop_front)
                .map(|payload| ((*channel).to_string(), payload))
        })
    }

    fn live_slot(&mut self, key: &str) -> Option<&String> {
        let expired = self
            .slots
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= Instant::now());
        if expired {
            self.slots.remove(key);
        }
        self.slots.get(key).map(|(value, _)| value)
    }

    /// Drop every slot whose TTL has passed.
    fn purge_expired_slots(&mut self) {
        let now = Instant::now();
        self.slots.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// In-process broker for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    pushed: Condvar,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Broker for MemoryBroker {
    fn push(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        self.lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push_back(payload.to_string());
        self.pushed.notify_all();
        Ok(())
    }

    fn pop(&self, channel: &str) -> Result<Option<String>, BrokerError> {
        Ok(self
            .lock()
            .channels
            .get_mut(channel)
            .and_then(VecDeque::pop_front))
    }

    fn pop_wait(
        &self,
        channels: &[&str],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(found) = state.pop_first(channels) {
                return Ok(Some(found));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .pushed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn len(&self, channel: &str) -> Result<usize, BrokerError> {
        Ok(self.lock().channels.get(channel).map_or(0, VecDeque::len))
    }

    /// Expired slots are purged on every write, so slots nobody reads
    /// do not accumulate.
    fn set_slot(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.purge_expired_slots();
        state
            .slots
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn take_slot(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut state = self.lock();
        let live = state.live_slot(key).is_some();
        Ok(if live {
            state.slots.remove(key).map(|(value, _)| value)
        } else {
            None
        })
    }

    fn get_slot(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.lock().live_slot(key).cloned())
    }
}
