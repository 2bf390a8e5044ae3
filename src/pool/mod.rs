//! Connection pool (spec.md §4.3): a fixed set of slots cycling through
//! `AVAILABLE -> IN_USE -> {AVAILABLE, DEAD} -> {AVAILABLE, PERMANENT_FAILURE}`,
//! guarded by a single mutex + condition variable pair.
//!
//! Concurrency idiom grounded on the pack's `OxiDB::core::connection::pool`
//! (`std::sync::{Mutex, Condvar}` with `PooledConnection`'s `Drop`-based
//! auto-release) rather than the teacher's `tokio::sync` primitives — spec.md
//! §5 mandates OS threads, see `SPEC_FULL.md` §5.

pub mod connection;
pub mod pg;

use crate::consts::{truncate_error, DEAD_THRESHOLD, MAX_BACKOFF_EXPONENT, MAX_RECOVERY_ATTEMPTS, RECOVERY_BACKOFF_BASE_MS};
use crate::error::PoolError;
use crate::{log_error, log_info, log_warn};
use connection::{ConnectionFactory, DbConnection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Sink for the two counters the pool's recovery path updates (spec.md §3's
/// `connection_resets` / `connection_failures`), kept out of `ConnectionPool`
/// itself so the pool need not know about `StatsTracker` or its lock.
///
/// Events are only ever delivered with `pool_mutex` *not* held (see
/// `ConnectionPool::emit_events`), so a `StatsTracker` implementation is free
/// to take `stats_mutex` without risking the lock-inversion spec.md §5 warns
/// against between `stats_mutex` and `pool_mutex`.
pub trait PoolObserver: Send + Sync {
    fn on_connection_reset(&self);
    fn on_connection_failure(&self);
}

struct NoopObserver;

impl PoolObserver for NoopObserver {
    fn on_connection_reset(&self) {}
    fn on_connection_failure(&self) {}
}

#[derive(Debug, Clone, Copy)]
enum PoolEvent {
    Reset,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Available,
    InUse,
    Dead,
    PermanentFailure,
}

struct Slot<C: DbConnection> {
    id: usize,
    connection: Option<C>,
    state: SlotState,
    last_used: Instant,
    failed_attempts: u32,
    recovery_attempts: u32,
    next_recovery_attempt: Option<Instant>,
    last_error: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolCounts {
    pub available: usize,
    pub in_use: usize,
    pub dead: usize,
    pub permanent_failure: usize,
}

impl PoolCounts {
    pub fn healthy(&self) -> usize {
        self.available + self.in_use
    }

    pub fn total(&self) -> usize {
        self.available + self.in_use + self.dead + self.permanent_failure
    }
}

pub struct ConnectionPool<C: DbConnection, F: ConnectionFactory<C>> {
    slots: Mutex<Vec<Slot<C>>>,
    cond: Condvar,
    shutdown: AtomicBool,
    require_secure_transport: bool,
    factory: F,
    observer: Arc<dyn PoolObserver>,
}

impl<C: DbConnection, F: ConnectionFactory<C>> std::fmt::Debug for ConnectionPool<C, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("pool_size", &self.pool_size())
            .field("require_secure_transport", &self.require_secure_transport)
            .field("shutdown", &self.shutdown.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<C: DbConnection, F: ConnectionFactory<C>> ConnectionPool<C, F> {
    /// Opens `pool_size` connections via `factory`, preparing the bulk-copy
    /// statement on each. Connections that fail to open, fail their secure
    /// transport check, or fail to prepare start the slot as `DEAD` rather
    /// than aborting the whole pool — init only aborts if *zero* slots end up
    /// healthy (spec.md §4.7).
    pub fn open(pool_size: usize, require_secure_transport: bool, factory: F) -> Self {
        Self::open_with_observer(pool_size, require_secure_transport, factory, Arc::new(NoopObserver))
    }

    /// As [`Self::open`], but recovery successes/failures are reported to
    /// `observer` — the orchestrator wires this to the [`crate::stats::StatsTracker`]
    /// so `connection_resets`/`connection_failures` stay current.
    pub fn open_with_observer(
        pool_size: usize,
        require_secure_transport: bool,
        factory: F,
        observer: Arc<dyn PoolObserver>,
    ) -> Self {
        let mut slots = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            slots.push(Self::open_one_slot(id, require_secure_transport, &factory));
        }

        ConnectionPool {
            slots: Mutex::new(slots),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            require_secure_transport,
            factory,
            observer,
        }
    }

    fn open_one_slot(id: usize, require_secure_transport: bool, factory: &F) -> Slot<C> {
        let now = Instant::now();
        match factory.connect() {
            Ok(mut conn) => {
                if !conn.is_healthy() || (require_secure_transport && !conn.has_secure_session()) {
                    let reason = if !conn.is_healthy() {
                        "connection unhealthy immediately after connect".to_string()
                    } else {
                        "secure transport required but not negotiated".to_string()
                    };
                    log_error!("slot {} failed startup health check: {}", id, reason);
                    return Slot {
                        id,
                        connection: None,
                        state: SlotState::Dead,
                        last_used: now,
                        failed_attempts: 0,
                        recovery_attempts: 0,
                        next_recovery_attempt: None,
                        last_error: truncate_error(&reason),
                    };
                }
                if let Err(e) = conn.prepare_bulk_copy() {
                    log_error!("slot {} failed to prepare bulk copy statement: {}", id, e);
                    return Slot {
                        id,
                        connection: None,
                        state: SlotState::Dead,
                        last_used: now,
                        failed_attempts: 0,
                        recovery_attempts: 0,
                        next_recovery_attempt: None,
                        last_error: truncate_error(&e),
                    };
                }
                log_info!("slot {} opened successfully", id);
                Slot {
                    id,
                    connection: Some(conn),
                    state: SlotState::Available,
                    last_used: now,
                    failed_attempts: 0,
                    recovery_attempts: 0,
                    next_recovery_attempt: None,
                    last_error: String::new(),
                }
            }
            Err(e) => {
                log_error!("slot {} failed to open: {}", id, e);
                Slot {
                    id,
                    connection: None,
                    state: SlotState::Dead,
                    last_used: now,
                    failed_attempts: 0,
                    recovery_attempts: 0,
                    next_recovery_attempt: None,
                    last_error: truncate_error(&e),
                }
            }
        }
    }

    pub fn counts(&self) -> PoolCounts {
        let guard = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counts = PoolCounts::default();
        for slot in guard.iter() {
            match slot.state {
                SlotState::Available => counts.available += 1,
                SlotState::InUse => counts.in_use += 1,
                SlotState::Dead => counts.dead += 1,
                SlotState::PermanentFailure => counts.permanent_failure += 1,
            }
        }
        counts
    }

    pub fn pool_size(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Acquisition algorithm (spec.md §4.3): scan for an available healthy
    /// slot; if none, attempt to recover a dead slot; if still none, wait on
    /// the pool condvar for at most one second. Only a genuine timeout (no
    /// notify arrived) or an observed shutdown produces an error — a notify
    /// before the deadline simply retries the scan.
    ///
    /// Shutdown is consulted only at the point this call would otherwise
    /// block on the condvar, not before the initial scan: spec.md §5 says
    /// acquire "terminates when the shutdown flag is observed" during its
    /// wait/retry cycle, not that it refuses an already-available connection
    /// outright. This lets `request_shutdown`'s residual-buffer flush still
    /// acquire a healthy, idle connection after the flag has been set.
    pub fn acquire(&self) -> Result<PooledConnection<'_, C, F>, PoolError> {
        let mut guard = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some((idx, conn)) = Self::claim_available(&mut guard) {
                let id = guard[idx].id;
                return Ok(PooledConnection::new(self, id, conn));
            }

            let mut events = Vec::new();
            if let Some((idx, conn)) = self.try_recover_one(&mut guard, &mut events) {
                let id = guard[idx].id;
                drop(guard);
                self.emit_events(&events);
                return Ok(PooledConnection::new(self, id, conn));
            }

            if !events.is_empty() {
                // Release pool_mutex before touching the observer (typically
                // StatsTracker, which takes stats_mutex) so this path never
                // holds pool_mutex and stats_mutex at once in either order.
                drop(guard);
                self.emit_events(&events);
                guard = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            if self.shutdown.load(Ordering::Acquire) {
                return Err(PoolError::ShuttingDown);
            }

            let (next_guard, wait_result) = self
                .cond
                .wait_timeout(guard, Duration::from_secs(1))
                .unwrap_or_else(PoisonError::into_inner);
            guard = next_guard;

            if wait_result.timed_out() {
                log_warn!("pool acquire timed out waiting for a healthy connection");
                return Err(PoolError::Timeout);
            }
        }
    }

    fn claim_available(guard: &mut MutexGuard<'_, Vec<Slot<C>>>) -> Option<(usize, C)> {
        let idx = guard
            .iter()
            .position(|s| s.state == SlotState::Available && s.connection.is_some())?;
        let conn = guard[idx].connection.take()?;
        guard[idx].state = SlotState::InUse;
        guard[idx].last_used = Instant::now();
        Some((idx, conn))
    }

    fn try_recover_one(&self, guard: &mut MutexGuard<'_, Vec<Slot<C>>>, events: &mut Vec<PoolEvent>) -> Option<(usize, C)> {
        let dead_indices: Vec<usize> = guard
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Dead)
            .map(|(idx, _)| idx)
            .collect();

        for idx in dead_indices {
            if let Some(conn) = self.recover_slot(guard, idx, events) {
                guard[idx].state = SlotState::InUse;
                guard[idx].last_used = Instant::now();
                return Some((idx, conn));
            }
        }
        None
    }

    fn emit_events(&self, events: &[PoolEvent]) {
        for event in events {
            match event {
                PoolEvent::Reset => self.observer.on_connection_reset(),
                PoolEvent::Failure => self.observer.on_connection_failure(),
            }
        }
    }

    /// Six-step recovery algorithm run under the pool lock (spec.md §4.3):
    /// respect backoff, quarantine past `MAX_RECOVERY_ATTEMPTS`, dispose and
    /// reconnect, re-check health/secure transport, re-prepare, and on
    /// success reset the slot's failure counters.
    fn recover_slot(&self, guard: &mut MutexGuard<'_, Vec<Slot<C>>>, idx: usize, events: &mut Vec<PoolEvent>) -> Option<C> {
        let now = Instant::now();

        if let Some(next) = guard[idx].next_recovery_attempt {
            if now < next {
                return None;
            }
        }

        if guard[idx].recovery_attempts >= MAX_RECOVERY_ATTEMPTS {
            if guard[idx].state != SlotState::PermanentFailure {
                let id = guard[idx].id;
                let attempts = guard[idx].recovery_attempts;
                guard[idx].state = SlotState::PermanentFailure;
                log_error!("slot {} permanently quarantined after {} failed recovery attempts", id, attempts);
            }
            return None;
        }

        guard[idx].connection = None;
        let id = guard[idx].id;

        let mut conn = match self.factory.connect() {
            Ok(c) => c,
            Err(e) => {
                self.record_recovery_failure(guard, idx, e, events);
                return None;
            }
        };

        if !conn.is_healthy() || (self.require_secure_transport && !conn.has_secure_session()) {
            let reason = if !conn.is_healthy() {
                "connection unhealthy after reconnect".to_string()
            } else {
                "secure transport required but not negotiated".to_string()
            };
            self.record_recovery_failure(guard, idx, reason, events);
            return None;
        }

        if let Err(e) = conn.prepare_bulk_copy() {
            self.record_recovery_failure(guard, idx, e, events);
            return None;
        }

        guard[idx].failed_attempts = 0;
        guard[idx].recovery_attempts = 0;
        guard[idx].next_recovery_attempt = None;
        guard[idx].last_error.clear();
        log_info!("slot {} recovered successfully", id);
        events.push(PoolEvent::Reset);
        Some(conn)
    }

    fn record_recovery_failure(
        &self,
        guard: &mut MutexGuard<'_, Vec<Slot<C>>>,
        idx: usize,
        reason: String,
        events: &mut Vec<PoolEvent>,
    ) {
        guard[idx].recovery_attempts += 1;
        guard[idx].last_error = truncate_error(&reason);
        let exponent = guard[idx].recovery_attempts.min(MAX_BACKOFF_EXPONENT);
        let backoff_ms = RECOVERY_BACKOFF_BASE_MS.saturating_mul(1u64 << exponent);
        guard[idx].next_recovery_attempt = Some(Instant::now() + Duration::from_millis(backoff_ms));
        log_warn!(
            "slot {} recovery attempt {} failed: {}",
            guard[idx].id,
            guard[idx].recovery_attempts,
            reason
        );
        events.push(PoolEvent::Failure);
    }

    /// Returns a checked-out connection to its slot. `had_error` marks the
    /// operation that used it as failed; after `DEAD_THRESHOLD` consecutive
    /// failed releases the slot transitions to `DEAD`.
    fn release(&self, slot_id: usize, had_error: bool, connection: Option<C>) {
        let mut guard = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = guard.iter_mut().find(|s| s.id == slot_id) {
            slot.connection = connection;
            if had_error {
                slot.failed_attempts += 1;
                if slot.failed_attempts >= DEAD_THRESHOLD && slot.state != SlotState::PermanentFailure {
                    if slot.state != SlotState::Dead {
                        log_error!("slot {} marked dead after {} consecutive failed releases", slot_id, slot.failed_attempts);
                    }
                    slot.state = SlotState::Dead;
                } else if slot.state != SlotState::PermanentFailure {
                    slot.state = SlotState::Available;
                }
            } else {
                slot.failed_attempts = 0;
                if slot.state != SlotState::PermanentFailure {
                    slot.state = SlotState::Available;
                }
            }
        }
        drop(guard);
        self.cond.notify_one();
    }

    /// Marks a slot dead immediately, bypassing the `DEAD_THRESHOLD` counter
    /// — used for failures that indict the connection itself (spec.md §4.5).
    pub fn mark_dead(&self, slot_id: usize, reason: &str) {
        let mut guard = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = guard.iter_mut().find(|s| s.id == slot_id) {
            if slot.state != SlotState::Dead && slot.state != SlotState::PermanentFailure {
                slot.state = SlotState::Dead;
                slot.last_error = truncate_error(reason);
                log_error!("slot {} marked dead: {}", slot_id, reason);
            }
        }
        drop(guard);
        self.cond.notify_one();
    }
}

/// RAII handle to a checked-out connection. The underlying `C` is physically
/// moved out of the slot while in use, so no slot-state lock is held for the
/// duration of I/O; `Drop` returns it to the pool and notifies waiters.
pub struct PooledConnection<'p, C: DbConnection, F: ConnectionFactory<C>> {
    pool: &'p ConnectionPool<C, F>,
    slot_id: usize,
    connection: Option<C>,
    had_error: bool,
}

impl<'p, C: DbConnection, F: ConnectionFactory<C>> std::fmt::Debug for PooledConnection<'p, C, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot_id", &self.slot_id)
            .field("had_error", &self.had_error)
            .field("connection", &self.connection)
            .finish()
    }
}

impl<'p, C: DbConnection, F: ConnectionFactory<C>> PooledConnection<'p, C, F> {
    fn new(pool: &'p ConnectionPool<C, F>, slot_id: usize, connection: C) -> Self {
        PooledConnection {
            pool,
            slot_id,
            connection: Some(connection),
            had_error: false,
        }
    }

    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub fn mark_error(&mut self) {
        self.had_error = true;
    }
}

impl<'p, C: DbConnection, F: ConnectionFactory<C>> std::ops::Deref for PooledConnection<'p, C, F> {
    type Target = C;
    fn deref(&self) -> &C {
        self.connection.as_ref().expect("connection present for the life of the guard")
    }
}

impl<'p, C: DbConnection, F: ConnectionFactory<C>> std::ops::DerefMut for PooledConnection<'p, C, F> {
    fn deref_mut(&mut self) -> &mut C {
        self.connection.as_mut().expect("connection present for the life of the guard")
    }
}

impl<'p, C: DbConnection, F: ConnectionFactory<C>> Drop for PooledConnection<'p, C, F> {
    fn drop(&mut self) {
        let connection = self.connection.take();
        self.pool.release(self.slot_id, self.had_error, connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::connection::{ChunkResult, ChunkWriter, CopyOutcome};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Debug)]
    struct MockConnection {
        healthy: Arc<AtomicBool>,
        secure: bool,
        prepare_fails: bool,
        copy_script: Vec<ChunkResult>,
    }

    impl MockConnection {
        fn healthy_secure() -> Self {
            MockConnection {
                healthy: Arc::new(AtomicBool::new(true)),
                secure: true,
                prepare_fails: false,
                copy_script: vec![ChunkResult::Written],
            }
        }
    }

    struct MockChunkWriter<'a>(std::slice::Iter<'a, ChunkResult>);

    impl<'a> ChunkWriter for MockChunkWriter<'a> {
        fn put_chunk(&mut self, _data: &[u8]) -> ChunkResult {
            self.0.next().copied().unwrap_or(ChunkResult::Written)
        }
        fn drain_inbound(&mut self) {}
    }

    impl DbConnection for MockConnection {
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::Acquire)
        }
        fn has_secure_session(&self) -> bool {
            self.secure
        }
        fn prepare_bulk_copy(&mut self) -> Result<(), String> {
            if self.prepare_fails {
                Err("prepare failed".to_string())
            } else {
                Ok(())
            }
        }
        fn run_bulk_copy(&mut self, data: &[u8]) -> CopyOutcome {
            let mut writer = MockChunkWriter(self.copy_script.iter());
            let result = crate::copy::drive_chunks(&mut writer, data, data.len().max(1));
            if result.aborted {
                CopyOutcome::fatal(result.bytes_written, result.abort_reason.unwrap_or_default())
            } else {
                CopyOutcome::success(result.bytes_written)
            }
        }
    }

    fn always_ok_factory() -> impl Fn() -> Result<MockConnection, String> {
        || Ok(MockConnection::healthy_secure())
    }

    #[test]
    fn acquire_then_release_returns_slot_to_available() {
        let pool = ConnectionPool::open(2, true, always_ok_factory());
        assert_eq!(pool.counts().available, 2);
        {
            let pooled = pool.acquire().unwrap();
            assert_eq!(pool.counts().in_use, 1);
            drop(pooled);
        }
        assert_eq!(pool.counts().available, 2);
    }

    #[test]
    fn release_with_error_accumulates_toward_dead_threshold() {
        let pool = ConnectionPool::open(1, true, always_ok_factory());
        for _ in 0..DEAD_THRESHOLD - 1 {
            let mut pooled = pool.acquire().unwrap();
            pooled.mark_error();
        }
        assert_eq!(pool.counts().available, 1);
        let mut pooled = pool.acquire().unwrap();
        pooled.mark_error();
        drop(pooled);
        assert_eq!(pool.counts().dead, 1);
    }

    #[test]
    fn mark_dead_is_idempotent_and_immediate() {
        let pool = ConnectionPool::open(1, true, always_ok_factory());
        let pooled = pool.acquire().unwrap();
        let id = pooled.slot_id();
        drop(pooled);
        pool.mark_dead(id, "boom");
        pool.mark_dead(id, "boom again");
        assert_eq!(pool.counts().dead, 1);
    }

    #[test]
    fn acquire_times_out_when_all_slots_dead() {
        let pool: ConnectionPool<MockConnection, _> = ConnectionPool::open(1, true, always_ok_factory());
        let pooled = pool.acquire().unwrap();
        let id = pooled.slot_id();
        drop(pooled);
        pool.mark_dead(id, "unrecoverable for this test");

        // force recovery to keep failing by wrapping a factory that always errors
        let failing_pool: ConnectionPool<MockConnection, _> =
            ConnectionPool::open(1, true, || -> Result<MockConnection, String> { Err("down".to_string()) });
        let acquired = failing_pool.acquire();
        assert!(matches!(acquired, Err(PoolError::Timeout)));
    }

    #[test]
    fn recovery_respects_backoff_between_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let pool: ConnectionPool<MockConnection, _> = ConnectionPool::open(1, true, move || -> Result<MockConnection, String> {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            Err("still down".to_string())
        });
        assert_eq!(pool.counts().dead, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "only the initial open attempt should have run");

        let result = pool.acquire();
        assert!(matches!(result, Err(PoolError::Timeout)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2, "one recovery attempt, then backoff blocks a second");
    }

    #[test]
    fn permanent_failure_after_max_recovery_attempts() {
        let pool: ConnectionPool<MockConnection, _> =
            ConnectionPool::open(1, true, || -> Result<MockConnection, String> { Err("down".to_string()) });

        for _ in 0..=MAX_RECOVERY_ATTEMPTS {
            let mut guard = pool.slots.lock().unwrap();
            guard[0].next_recovery_attempt = None;
            drop(guard);
            let _ = pool.acquire();
        }

        assert_eq!(pool.counts().permanent_failure, 1);
    }

    #[derive(Default)]
    struct CountingObserver {
        resets: AtomicUsize,
        failures: AtomicUsize,
    }

    impl PoolObserver for CountingObserver {
        fn on_connection_reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
        fn on_connection_failure(&self) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn observer_sees_one_failure_then_one_reset_across_recovery() {
        let should_fail = Arc::new(AtomicBool::new(true));
        let should_fail_clone = should_fail.clone();
        let observer = Arc::new(CountingObserver::default());
        let pool: ConnectionPool<MockConnection, _> = ConnectionPool::open_with_observer(
            1,
            true,
            move || -> Result<MockConnection, String> {
                if should_fail_clone.load(Ordering::SeqCst) {
                    Err("still down".to_string())
                } else {
                    Ok(MockConnection::healthy_secure())
                }
            },
            observer.clone() as Arc<dyn PoolObserver>,
        );
        assert_eq!(pool.counts().dead, 1);

        let _ = pool.acquire();
        should_fail.store(false, Ordering::SeqCst);
        {
            let mut guard = pool.slots.lock().unwrap();
            guard[0].next_recovery_attempt = None;
            drop(guard);
        }
        let pooled = pool.acquire().expect("recovery should succeed once factory stops failing");
        drop(pooled);

        assert_eq!(observer.failures.load(Ordering::SeqCst), 1);
        assert_eq!(observer.resets.load(Ordering::SeqCst), 1);
    }
}
