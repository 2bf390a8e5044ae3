//! Background health/stats worker supervisor (spec.md §4.6).
//!
//! Workers are pure observers: they never touch the batch buffer or the
//! pool's connections, only the counters spec.md §3 already exposes. They
//! talk to the orchestrator context only through [`WorkerContext`] — the
//! "message-passing variant where workers receive only the data they need"
//! spec.md §9 offers as an alternative to a back-reference with a weak
//! pointer, which also sidesteps the two sibling modules (`workers`,
//! `orchestrator`) needing to know each other's concrete types.

use crate::consts::{WORKER_POLL_INTERVAL, WORKER_STATS_INTERVAL};
use crate::pool::PoolCounts;
use crate::stats::StatsTracker;
use crate::{log_info, log_warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// The slice of orchestrator state a background worker needs to read.
/// Implemented by `crate::orchestrator::Context`.
pub trait WorkerContext: Send + Sync {
    fn stats(&self) -> &StatsTracker;
    fn pool_counts(&self) -> PoolCounts;
    fn pool_size(&self) -> usize;
    fn is_shutting_down(&self) -> bool;
}

/// Owns the background worker threads' `JoinHandle`s. `start`/`stop` are the
/// only public operations (spec.md §4.6); `stop` is idempotent because a
/// second call simply finds no handles left to join.
#[derive(Debug, Default)]
pub struct WorkerSupervisor {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        WorkerSupervisor {
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `num_workers` background threads, each running [`worker_loop`]
    /// against a clone of `context`.
    pub fn start<Ctx>(&self, context: &Arc<Ctx>, num_workers: usize)
    where
        Ctx: WorkerContext + 'static,
    {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for id in 0..num_workers {
            let worker_context = Arc::clone(context);
            let spawned = thread::Builder::new()
                .name(format!("hydrant-worker-{id}"))
                .spawn(move || worker_loop(worker_context, id));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => log_warn!("failed to spawn worker thread {}: {}", id, e),
            }
        }
    }

    /// Joins every worker thread spawned by `start`. Safe to call more than
    /// once: the handle list is drained on the first call, so later calls
    /// join nothing.
    pub fn stop(&self) {
        let handles = {
            let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// One worker's loop body (spec.md §4.6): every second, check whether 60s
/// have elapsed since this worker's last heartbeat and, if so, log a status
/// summary; then check pool health and warn if too many slots are
/// unavailable. Exits as soon as the shutdown flag is observed.
fn worker_loop<Ctx: WorkerContext>(context: Arc<Ctx>, id: usize) {
    let mut last_heartbeat = Instant::now();

    while !context.is_shutting_down() {
        let now = Instant::now();
        if now.duration_since(last_heartbeat) > WORKER_STATS_INTERVAL {
            let snapshot = context.stats().running_snapshot();
            log_info!(
                "worker {} heartbeat: batches_processed={} errors={}",
                id,
                snapshot.batches_processed,
                snapshot.errors
            );
            last_heartbeat = now;
        }

        let counts = context.pool_counts();
        let pool_size = context.pool_size();
        let unhealthy = counts.dead + counts.permanent_failure;
        if unhealthy > 0 && counts.available < pool_size / 2 {
            log_warn!(
                "worker {} observed {} unhealthy connections, only {} of {} slots available",
                id,
                unhealthy,
                counts.available,
                pool_size
            );
        }

        thread::sleep(WORKER_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeContext {
        stats: StatsTracker,
        shutdown: AtomicBool,
        dead: usize,
        available: usize,
        pool_size: usize,
    }

    impl WorkerContext for FakeContext {
        fn stats(&self) -> &StatsTracker {
            &self.stats
        }
        fn pool_counts(&self) -> PoolCounts {
            PoolCounts {
                available: self.available,
                in_use: 0,
                dead: self.dead,
                permanent_failure: 0,
            }
        }
        fn pool_size(&self) -> usize {
            self.pool_size
        }
        fn is_shutting_down(&self) -> bool {
            self.shutdown.load(Ordering::Acquire)
        }
    }

    #[test]
    fn start_then_stop_joins_all_workers() {
        let context = Arc::new(FakeContext {
            stats: StatsTracker::with_ring_capacity(4),
            shutdown: AtomicBool::new(false),
            dead: 0,
            available: 4,
            pool_size: 4,
        });
        let supervisor = WorkerSupervisor::new();
        supervisor.start(&context, 2);
        context.shutdown.store(true, Ordering::Release);
        supervisor.stop();
        // Idempotent: a second stop() must not panic or block.
        supervisor.stop();
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let supervisor = WorkerSupervisor::new();
        supervisor.stop();
    }
}
