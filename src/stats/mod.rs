//! Batch stats ring and running totals (spec.md §3, §4.7).
//!
//! The rolling mean batch time is computed incrementally (a Welford-style
//! running mean) rather than derived from ring-index arithmetic, sidestepping
//! the underflow-on-first-rollover issue spec.md §9 flags for a naive
//! ring-sum approach.

use crate::consts::STATS_RING_SIZE;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub processed_bytes: u64,
    pub failed_bytes: u64,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct RunningStats {
    pub total_bytes: u64,
    pub batches_processed: u64,
    pub errors: u64,
    pub connection_resets: u64,
    pub connection_failures: u64,
    pub avg_batch_time_ms: f64,
    pub start_time: Instant,
    pub last_batch_time: Option<Instant>,
}

impl RunningStats {
    fn new() -> Self {
        RunningStats {
            total_bytes: 0,
            batches_processed: 0,
            errors: 0,
            connection_resets: 0,
            connection_failures: 0,
            avg_batch_time_ms: 0.0,
            start_time: Instant::now(),
            last_batch_time: None,
        }
    }
}

struct StatsInner {
    ring: VecDeque<BatchRecord>,
    ring_capacity: usize,
    running: RunningStats,
}

#[derive(Debug)]
pub struct StatsTracker {
    inner: Mutex<StatsInner>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::with_ring_capacity(STATS_RING_SIZE)
    }

    pub fn with_ring_capacity(ring_capacity: usize) -> Self {
        StatsTracker {
            inner: Mutex::new(StatsInner {
                ring: VecDeque::with_capacity(ring_capacity),
                ring_capacity,
                running: RunningStats::new(),
            }),
        }
    }

    /// Records one completed flush: `errors` increments only when `failed >
    /// 0`, matching spec.md's chosen `failed`-field contract exactly (this
    /// means a failure whose unshipped tail happens to be zero, e.g. a
    /// commit-time failure after a fully-streamed copy, does not itself
    /// increment `errors` — an acknowledged edge case, see `DESIGN.md`).
    pub fn record_batch(&self, processed: u64, failed: u64, elapsed_ms: u64) {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.running.batches_processed += 1;
        guard.running.total_bytes += processed;
        if failed > 0 {
            guard.running.errors += 1;
        }
        let count = guard.running.batches_processed as f64;
        let delta = elapsed_ms as f64 - guard.running.avg_batch_time_ms;
        guard.running.avg_batch_time_ms += delta / count;
        guard.running.last_batch_time = Some(Instant::now());

        if guard.ring_capacity > 0 {
            if guard.ring.len() >= guard.ring_capacity {
                guard.ring.pop_front();
            }
            guard.ring.push_back(BatchRecord {
                processed_bytes: processed,
                failed_bytes: failed,
                timestamp: Local::now(),
            });
        }
    }

    pub fn record_connection_reset(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.running.connection_resets += 1;
    }

    pub fn record_connection_failure(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.running.connection_failures += 1;
    }

    pub fn running_snapshot(&self) -> RunningStats {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).running.clone()
    }

    pub fn recent_batches(&self, limit: usize) -> Vec<BatchRecord> {
        let guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.ring.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Lets the pool report recovery outcomes without depending on
/// `StatsTracker` directly (see `crate::pool::PoolObserver`). The pool only
/// ever calls these with `pool_mutex` released, so taking `stats_mutex` here
/// cannot invert spec.md §5's mandated lock order.
impl crate::pool::PoolObserver for StatsTracker {
    fn on_connection_reset(&self) {
        self.record_connection_reset();
    }

    fn on_connection_failure(&self) {
        self.record_connection_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_batch_accumulates_totals() {
        let stats = StatsTracker::with_ring_capacity(4);
        stats.record_batch(100, 0, 10);
        stats.record_batch(200, 50, 20);
        let snapshot = stats.running_snapshot();
        assert_eq!(snapshot.total_bytes, 300);
        assert_eq!(snapshot.batches_processed, 2);
        assert_eq!(snapshot.errors, 1);
    }

    #[test]
    fn rolling_mean_tracks_incremental_average() {
        let stats = StatsTracker::with_ring_capacity(4);
        stats.record_batch(10, 0, 10);
        stats.record_batch(10, 0, 20);
        stats.record_batch(10, 0, 30);
        let snapshot = stats.running_snapshot();
        assert!((snapshot.avg_batch_time_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn ring_drops_oldest_record_past_capacity() {
        let stats = StatsTracker::with_ring_capacity(2);
        stats.record_batch(1, 0, 1);
        stats.record_batch(2, 0, 1);
        stats.record_batch(3, 0, 1);
        let recent = stats.recent_batches(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].processed_bytes, 3);
        assert_eq!(recent[1].processed_bytes, 2);
    }
}
