//! Lock-free write counters shared between the coordinator and health
//! reporting.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one coordinator.
#[derive(Debug, Default)]
pub struct WriteStats {
    processed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

/// A point-in-time copy of [`WriteStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl WriteStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a committed write. Returns the new total.
    pub fn record_processed(&self) -> u64 {
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count a write that will not be retried. Returns the new total.
    pub fn record_failed(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_requeued(&self) -> u64 {
        self.requeued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count a dead-lettered write. It is also counted as failed.
    pub fn record_dead_lettered(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.dead_lettered.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::SeqCst)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed(),
            failed: self.failed(),
            requeued: self.requeued(),
            dead_lettered: self.dead_lettered(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters() {
        let stats = WriteStats::new();
        assert_eq!(stats.record_processed(), 1);
        assert_eq!(stats.record_processed(), 2);
        assert_eq!(stats.record_requeued(), 1);
        assert_eq!(stats.record_dead_lettered(), 1);

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                processed: 2,
                failed: 1,
                requeued: 1,
                dead_lettered: 1,
            }
        );
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(WriteStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_processed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.processed(), 4000);
    }
}
