//! Queue statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for queue operations.
///
/// All counters are atomic and can be safely accessed from multiple threads.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Keys accepted by `add`.
    adds: AtomicU64,
    /// `add` calls collapsed into an already pending key.
    deduplicated: AtomicU64,
    /// Rate-limited re-adds.
    retries: AtomicU64,
    /// In-flight passes finished with `done`.
    completed: AtomicU64,
}

impl QueueStats {
    #[inline]
    pub(crate) fn record_add(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dedup(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_done(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self, depth: usize, in_flight: usize, waiting: usize) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            adds: self.adds.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            depth,
            in_flight,
            waiting,
        }
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub adds: u64,
    pub deduplicated: u64,
    pub retries: u64,
    pub completed: u64,
    /// Keys ready to be handed out.
    pub depth: usize,
    /// Keys currently held by a worker.
    pub in_flight: usize,
    /// Keys waiting on a backoff timer.
    pub waiting: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = QueueStats::default();
        stats.record_add();
        stats.record_add();
        stats.record_dedup();
        stats.record_retry();
        stats.record_done();

        let snap = stats.snapshot(1, 2, 3);
        assert_eq!(snap.adds, 2);
        assert_eq!(snap.deduplicated, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!((snap.depth, snap.in_flight, snap.waiting), (1, 2, 3));
    }
}
