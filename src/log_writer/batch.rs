//! Accumulation of log records into one multi-row insert.

use std::time::{Duration, Instant};

use crate::message::LogRecord;
use crate::sql::epoch_to_datetime;

/// Limits for one log batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    /// Maximum records in one insert.
    pub max_records: usize,
    /// Maximum time spent greedily draining after the first record.
    pub max_drain_time: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: 100,
            max_drain_time: Duration::from_millis(250),
        }
    }
}

/// Records collected for one insert, each with the raw payload it was
/// decoded from so the batch can be pushed back unchanged.
#[derive(Debug)]
pub struct LogBatch {
    limits: BatchLimits,
    payloads: Vec<String>,
    records: Vec<LogRecord>,
    started: Option<Instant>,
    rejected: usize,
}

impl LogBatch {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            payloads: Vec::with_capacity(limits.max_records),
            records: Vec::with_capacity(limits.max_records),
            started: None,
            rejected: 0,
        }
    }

    /// Decode and add one raw payload.
    ///
    /// Undecodable payloads, and records whose `created_at` is not a
    /// representable time, are counted and dropped so the rest of the batch
    /// still inserts. Returns true once the batch should be flushed.
    pub fn push(&mut self, payload: String) -> bool {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        match decode(&payload) {
            Ok(record) => {
                self.records.push(record);
                self.payloads.push(payload);
            }
            Err(reason) => {
                self.rejected += 1;
                tracing::warn!(error = %reason, "Dropping invalid log record");
            }
        }
        self.is_ready()
    }

    /// Full, or out of drain time.
    pub fn is_ready(&self) -> bool {
        if self.payloads.len() + self.rejected >= self.limits.max_records {
            return true;
        }
        self.started
            .is_some_and(|start| start.elapsed() >= self.limits.max_drain_time)
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn payloads(&self) -> &[String] {
        &self.payloads
    }

    /// Payloads that failed to decode.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn decode(payload: &str) -> Result<LogRecord, String> {
    let record: LogRecord = serde_json::from_str(payload).map_err(|e| e.to_string())?;
    epoch_to_datetime(record.created_at).map_err(|e| e.to_string())?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(message: &str) -> String {
        serde_json::to_string(&LogRecord::new("agent-1", "info", message)).unwrap()
    }

    #[test]
    fn test_size_limit() {
        let mut batch = LogBatch::new(BatchLimits {
            max_records: 3,
            max_drain_time: Duration::from_secs(10),
        });

        assert!(!batch.push(payload("a")));
        assert!(!batch.push(payload("b")));
        assert!(batch.push(payload("c")));
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.records()[1].message, "b");
    }

    #[test]
    fn test_drain_time_limit() {
        let mut batch = LogBatch::new(BatchLimits {
            max_records: 100,
            max_drain_time: Duration::from_millis(10),
        });

        batch.push(payload("a"));
        assert!(!batch.is_ready());

        std::thread::sleep(Duration::from_millis(15));
        assert!(batch.is_ready());
    }

    #[test]
    fn test_invalid_payloads_are_rejected() {
        let mut batch = LogBatch::new(BatchLimits::default());
        batch.push("garbage".to_string());
        batch.push(payload("ok"));

        assert_eq!(batch.rejected(), 1);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.payloads().len(), 1);
    }

    #[test]
    fn test_out_of_range_timestamp_is_rejected_alone() {
        let mut batch = LogBatch::new(BatchLimits::default());
        batch.push(payload("before"));
        let mut bad = LogRecord::new("agent-1", "info", "far future");
        bad.created_at = 1e18;
        batch.push(serde_json::to_string(&bad).unwrap());
        batch.push(payload("after"));

        assert_eq!(batch.rejected(), 1);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records()[1].message, "after");
    }
}
