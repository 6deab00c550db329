//! Priority write queue.
//!
//! Producers enqueue [`WriteMessage`]s onto one of three FIFO channels
//! named `"{prefix}:{class}"`. The coordinator drains them through the same
//! [`WriteQueue`] and answers callers through TTL-bound reply slots.

pub mod broker;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::message::{LogRecord, MessageError, Operation, Priority, WriteMessage};
use crate::sql::{Params, Row};

pub use broker::{Broker, BrokerError, MemoryBroker};
pub use sqlite::SqliteBroker;

/// Default channel prefix.
pub const DEFAULT_PREFIX: &str = "write_queue";

/// How long a reply stays readable.
pub const REPLY_TTL: Duration = Duration::from_secs(30);

const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("invalid reply payload: {0}")]
    Reply(#[from] serde_json::Error),
}

/// Channel and slot names derived from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    prefix: String,
    critical: String,
    priority: String,
    normal: String,
    logs: String,
    dead_letter: String,
    health: String,
}

impl ChannelNames {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            critical: format!("{prefix}:critical"),
            priority: format!("{prefix}:priority"),
            normal: format!("{prefix}:normal"),
            logs: format!("{prefix}:logs"),
            dead_letter: format!("{prefix}:dead_letter"),
            health: format!("{prefix}:health"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn for_priority(&self, priority: Priority) -> &str {
        match priority {
            Priority::Critical => &self.critical,
            Priority::Priority => &self.priority,
            Priority::Normal => &self.normal,
        }
    }

    /// The priority class a channel name belongs to.
    pub fn priority_of(&self, channel: &str) -> Option<Priority> {
        Priority::ALL
            .into_iter()
            .find(|p| self.for_priority(*p) == channel)
    }

    pub fn logs(&self) -> &str {
        &self.logs
    }

    pub fn dead_letter(&self) -> &str {
        &self.dead_letter
    }

    pub fn health(&self) -> &str {
        &self.health
    }

    pub fn callback(&self, key: &str) -> String {
        format!("{}:callback:{key}", self.prefix)
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Result of one write, delivered to the caller's reply slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReply {
    pub success: bool,
    pub message_id: String,
    pub operation: Operation,
    pub table: String,
}

/// Pending messages per priority class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub critical: usize,
    pub priority: usize,
    pub normal: usize,
}

impl QueueDepths {
    pub fn total(&self) -> usize {
        self.critical + self.priority + self.normal
    }
}

/// A popped message and the raw payload it came from.
#[derive(Debug)]
pub struct Popped {
    pub priority: Priority,
    pub payload: String,
}

/// Handle on the priority channels. Cheap to clone.
#[derive(Clone)]
pub struct WriteQueue {
    broker: Arc<dyn Broker>,
    names: Arc<ChannelNames>,
}

impl WriteQueue {
    pub fn new(broker: Arc<dyn Broker>, prefix: &str) -> Self {
        Self {
            broker,
            names: Arc::new(ChannelNames::new(prefix)),
        }
    }

    /// A queue over a fresh [`MemoryBroker`].
    pub fn in_memory(prefix: &str) -> Self {
        Self::new(Arc::new(MemoryBroker::new()), prefix)
    }

    pub fn names(&self) -> &ChannelNames {
        &self.names
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Enqueue a built message. Returns its id without waiting for the write.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or the broker
    /// rejects the push.
    pub fn enqueue(&self, msg: &WriteMessage) -> Result<String, QueueError> {
        let channel = self.names.for_priority(msg.priority());
        self.broker.push(channel, &msg.encode()?)?;
        tracing::debug!(
            message_id = %msg.message_id(),
            table = %msg.table(),
            operation = %msg.operation(),
            priority = %msg.priority(),
            "Enqueued write"
        );
        Ok(msg.message_id().to_string())
    }

    /// Build and enqueue an insert of `data` into `table`.
    ///
    /// # Arguments
    ///
    /// * `table` - Target table, validated as a plain identifier
    /// * `data` - Column values; must not be empty
    /// * `source_id` - Producer name carried in logs and metrics
    /// * `priority` - Channel the message is pushed onto
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Message`] for an invalid table or empty row, or
    /// a broker error if the push fails.
    pub fn enqueue_insert(
        &self,
        table: &str,
        data: Row,
        source_id: &str,
        priority: Priority,
    ) -> Result<String, QueueError> {
        self.enqueue(&WriteMessage::insert(table, data, source_id, priority)?)
    }

    /// Build and enqueue a raw statement. `sql` uses `?` or `:name`
    /// placeholders, matching the shape of `params`.
    ///
    /// # Errors
    ///
    /// Returns an error if `sql` is empty or the broker rejects the push.
    /// Placeholder mismatches surface later, at translation.
    pub fn enqueue_execute(
        &self,
        sql: &str,
        params: Params,
        source_id: &str,
        priority: Priority,
    ) -> Result<String, QueueError> {
        self.enqueue(&WriteMessage::execute(sql, params, source_id, priority)?)
    }

    /// Re-enqueue a raw payload onto its class channel.
    pub(crate) fn push_raw(&self, priority: Priority, payload: &str) -> Result<(), QueueError> {
        Ok(self.broker.push(self.names.for_priority(priority), payload)?)
    }

    pub fn pop(&self, priority: Priority) -> Result<Option<String>, QueueError> {
        Ok(self.broker.pop(self.names.for_priority(priority))?)
    }

    /// Wait up to `timeout` for a message from any class, highest first.
    pub fn pop_any(&self, timeout: Duration) -> Result<Option<Popped>, QueueError> {
        let channels = Priority::ALL.map(|p| self.names.for_priority(p));
        let popped = self.broker.pop_wait(&channels, timeout)?;
        Ok(popped.and_then(|(channel, payload)| {
            self.names
                .priority_of(&channel)
                .map(|priority| Popped { priority, payload })
        }))
    }

    /// Park a payload that will not be retried again.
    pub fn dead_letter(&self, payload: &str) -> Result<(), QueueError> {
        Ok(self.broker.push(self.names.dead_letter(), payload)?)
    }

    pub fn dead_letter_depth(&self) -> Result<usize, QueueError> {
        Ok(self.broker.len(self.names.dead_letter())?)
    }

    pub fn depths(&self) -> Result<QueueDepths, QueueError> {
        Ok(QueueDepths {
            critical: self.broker.len(self.names.for_priority(Priority::Critical))?,
            priority: self.broker.len(self.names.for_priority(Priority::Priority))?,
            normal: self.broker.len(self.names.for_priority(Priority::Normal))?,
        })
    }

    /// Write a reply under `callback_key`, readable for [`REPLY_TTL`].
    pub fn send_reply(&self, callback_key: &str, reply: &WriteReply) -> Result<(), QueueError> {
        let payload = serde_json::to_string(reply)?;
        self.broker
            .set_slot(&self.names.callback(callback_key), &payload, REPLY_TTL)?;
        Ok(())
    }

    /// Take the reply under `callback_key` if it has arrived.
    pub fn take_reply(&self, callback_key: &str) -> Result<Option<WriteReply>, QueueError> {
        match self.broker.take_slot(&self.names.callback(callback_key))? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Block up to `timeout` for the reply under `callback_key`.
    ///
    /// Returns `Ok(None)` on timeout. A reply is consumed by the first
    /// reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails or the stored reply is not
    /// valid JSON.
    pub fn wait_for_reply(
        &self,
        callback_key: &str,
        timeout: Duration,
    ) -> Result<Option<WriteReply>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reply) = self.take_reply(callback_key)? {
                return Ok(Some(reply));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(REPLY_POLL_INTERVAL.min(deadline - now));
        }
    }

    pub fn enqueue_log(&self, record: &LogRecord) -> Result<(), QueueError> {
        let payload = serde_json::to_string(record)?;
        Ok(self.broker.push(self.names.logs(), &payload)?)
    }

    pub fn pop_log(&self) -> Result<Option<String>, QueueError> {
        Ok(self.broker.pop(self.names.logs())?)
    }

    pub fn pop_log_wait(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let channels = [self.names.logs()];
        Ok(self
            .broker
            .pop_wait(&channels, timeout)?
            .map(|(_, payload)| payload))
    }

    /// Return raw log payloads to the log channel.
    pub fn push_logs_back(&self, payloads: &[String]) -> Result<(), QueueError> {
        for payload in payloads {
            self.broker.push(self.names.logs(), payload)?;
        }
        Ok(())
    }

    pub fn log_depth(&self) -> Result<usize, QueueError> {
        Ok(self.broker.len(self.names.logs())?)
    }

    pub fn publish_health(&self, json: &str, ttl: Duration) -> Result<(), QueueError> {
        Ok(self.broker.set_slot(self.names.health(), json, ttl)?)
    }

    pub fn read_health(&self) -> Result<Option<String>, QueueError> {
        Ok(self.broker.get_slot(self.names.health())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::row;

    #[test]
    fn test_channel_names() {
        let names = ChannelNames::default();
        assert_eq!(names.for_priority(Priority::Critical), "write_queue:critical");
        assert_eq!(names.for_priority(Priority::Normal), "write_queue:normal");
        assert_eq!(names.callback("abc"), "write_queue:callback:abc");
        assert_eq!(names.health(), "write_queue:health");
        assert_eq!(names.priority_of("write_queue:priority"), Some(Priority::Priority));
        assert_eq!(names.priority_of("write_queue:logs"), None);
    }

    #[test]
    fn test_enqueue_returns_id_and_routes_by_priority() {
        let queue = WriteQueue::in_memory("t");
        let id = queue
            .enqueue_insert("agents", row([("name", "X")]), "a", Priority::Critical)
            .unwrap();
        assert_eq!(id.len(), 36);

        let depths = queue.depths().unwrap();
        assert_eq!(depths, QueueDepths { critical: 1, priority: 0, normal: 0 });

        let payload = queue.pop(Priority::Critical).unwrap().unwrap();
        assert_eq!(WriteMessage::decode(&payload).unwrap().message_id(), id);
    }

    #[test]
    fn test_invalid_message_is_not_enqueued() {
        let queue = WriteQueue::in_memory("t");
        let result = queue.enqueue_insert("", row([("name", "X")]), "a", Priority::Normal);
        assert!(matches!(result, Err(QueueError::Message(_))));
        assert_eq!(queue.depths().unwrap().total(), 0);
    }

    #[test]
    fn test_pop_any_highest_class_first() {
        let queue = WriteQueue::in_memory("t");
        queue
            .enqueue_execute("DELETE FROM a", Params::default(), "a", Priority::Normal)
            .unwrap();
        queue
            .enqueue_execute("DELETE FROM b", Params::default(), "a", Priority::Priority)
            .unwrap();

        let popped = queue.pop_any(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(popped.priority, Priority::Priority);
        let popped = queue.pop_any(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(popped.priority, Priority::Normal);
        assert!(queue.pop_any(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_reply_consumed_once() {
        let queue = WriteQueue::in_memory("t");
        let reply = WriteReply {
            success: true,
            message_id: "m".into(),
            operation: Operation::Insert,
            table: "agents".into(),
        };
        queue.send_reply("cb", &reply).unwrap();

        let got = queue.wait_for_reply("cb", Duration::from_secs(1)).unwrap();
        assert_eq!(got, Some(reply));
        assert_eq!(queue.take_reply("cb").unwrap(), None);
        assert_eq!(
            queue.wait_for_reply("cb", Duration::from_millis(30)).unwrap(),
            None
        );
    }

    #[test]
    fn test_log_channel() {
        let queue = WriteQueue::in_memory("t");
        queue.enqueue_log(&LogRecord::new("a", "info", "hello")).unwrap();
        let payload = queue.pop_log_wait(Duration::from_millis(10)).unwrap().unwrap();
        queue.push_logs_back(&[payload.clone()]).unwrap();
        assert_eq!(queue.log_depth().unwrap(), 1);
        assert_eq!(queue.pop_log().unwrap(), Some(payload));
    }
}
