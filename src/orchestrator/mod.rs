//! Orchestrator (spec.md §4.7): construction, the input-reading loop,
//! shutdown sequencing, and the JSON status snapshot. This is the one layer
//! that ties the pool, batch accumulator, bulk-copy driver, stats tracker,
//! and worker supervisor together into the running pipeline.

use crate::batch::BatchAccumulator;
use crate::config::Config;
use crate::consts::DEFAULT_NUM_WORKERS;
use crate::copy::flush;
use crate::error::OrchestratorError;
use crate::pool::connection::{ConnectionFactory, DbConnection};
use crate::pool::{ConnectionPool, PoolCounts};
use crate::stats::StatsTracker;
use crate::workers::{WorkerContext, WorkerSupervisor};
use crate::{log_error, log_info, log_warn};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Owns every piece of shared state the pipeline touches for the life of the
/// process (spec.md §3's "Orchestrator Context"). Always handed out behind
/// an `Arc` — worker threads hold clones of it for their lifetime, joined
/// before `request_shutdown` returns, so no cyclic ownership back to the
/// context itself ever outlives the process (spec.md §9's cyclic-ownership
/// note).
pub struct Context<C: DbConnection, F: ConnectionFactory<C>> {
    config: Config,
    pool: ConnectionPool<C, F>,
    batch: BatchAccumulator,
    stats: Arc<StatsTracker>,
    shutdown: AtomicBool,
    workers: WorkerSupervisor,
    start_time: Instant,
}

impl<C: DbConnection, F: ConnectionFactory<C>> std::fmt::Debug for Context<C, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("batch", &self.batch)
            .field("shutdown", &self.shutdown.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<C: DbConnection + 'static, F: ConnectionFactory<C> + 'static> Context<C, F> {
    /// `init` (spec.md §4.7): load config, clamp, open `POOL_SIZE`
    /// connections via `build_factory`, abort if none come up healthy,
    /// allocate the batch buffer and stats ring, and spawn the default
    /// worker count. `build_factory` is how the production binary supplies a
    /// `PgConnectionFactory`, while tests supply a factory over a mock
    /// `DbConnection`.
    pub fn init(
        config_path: Option<&Path>,
        pool_size: usize,
        build_factory: impl FnOnce(&Config) -> F,
    ) -> Result<Arc<Self>, OrchestratorError> {
        let config = Config::load(config_path)?;
        let stats = Arc::new(StatsTracker::new());
        let factory = build_factory(&config);

        let pool = ConnectionPool::open_with_observer(
            pool_size,
            config.require_secure_transport,
            factory,
            stats.clone() as Arc<dyn crate::pool::PoolObserver>,
        );

        if pool.counts().healthy() == 0 {
            log_error!("init aborted: zero healthy connections out of {} slots", pool_size);
            return Err(OrchestratorError::NoHealthyConnections);
        }

        let batch = BatchAccumulator::new(config.batch_capacity_bytes as usize);

        let context = Arc::new(Context {
            config,
            pool,
            batch,
            stats,
            shutdown: AtomicBool::new(false),
            workers: WorkerSupervisor::new(),
            start_time: Instant::now(),
        });

        context.workers.start(&context, DEFAULT_NUM_WORKERS);
        log_info!("hydrant context initialized with {} pool slots", pool_size);
        Ok(context)
    }

    /// `process_input` (spec.md §4.7): read chunks sized to the batch
    /// capacity until EOF, appending each into the buffer; on a rejected
    /// append, flush once and retry; a second rejection is fatal for this
    /// call. Honors the shutdown flag between reads, and flushes any
    /// residual buffer once input is exhausted. A mid-stream read error is
    /// logged at ERROR and breaks the loop (spec.md §7's "Input error" is
    /// clean-end-of-input-or-logged-and-stop, not a propagated failure), so
    /// this still always reaches the end-of-loop residual flush below.
    pub fn process_input(&self, mut input: impl Read) -> Result<(), OrchestratorError> {
        let chunk_size = self.batch.capacity().max(1);
        let mut chunk = vec![0u8; chunk_size];

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                log_info!("process_input observed shutdown, stopping before next read");
                break;
            }

            let read = match input.read(&mut chunk) {
                Ok(read) => read,
                Err(e) => {
                    log_error!("input read failed: {}", e);
                    break;
                }
            };
            if read == 0 {
                break;
            }

            if !self.batch.append(&chunk[..read]) {
                let result = flush(&self.batch, &self.pool, &self.stats);
                if !result.ok {
                    log_warn!(
                        "flush triggered by a full buffer failed: processed={} failed={}",
                        result.processed,
                        result.failed
                    );
                }
                if !self.batch.append(&chunk[..read]) {
                    log_error!(
                        "input chunk of {} bytes does not fit even in a freshly flushed buffer of capacity {}",
                        read,
                        chunk_size
                    );
                    break;
                }
            }
        }

        if self.batch.current_size() > 0 {
            let result = flush(&self.batch, &self.pool, &self.stats);
            if !result.ok {
                log_warn!(
                    "final flush at end of input failed: processed={} failed={}",
                    result.processed,
                    result.failed
                );
            }
        }

        Ok(())
    }

    /// `request_shutdown` (spec.md §4.7): flip the shutdown flag, tell the
    /// pool it is shutting down (so a waiting `acquire()` no longer blocks
    /// for a full second and gives up instead), join every worker, then
    /// flush any residual batch buffer before the context is torn down. The
    /// residual flush's own `acquire()` can still succeed here against an
    /// already-available, healthy slot — see `ConnectionPool::acquire`.
    /// Idempotent: a second call observes the flag already set.
    pub fn request_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            log_info!("request_shutdown called again, already shutting down");
            return;
        }

        log_info!("shutdown requested, joining workers before the residual flush");
        self.pool.request_shutdown();
        self.workers.stop();

        if self.batch.current_size() > 0 {
            let result = flush(&self.batch, &self.pool, &self.stats);
            if !result.ok {
                log_error!(
                    "residual buffer lost at shutdown: {} bytes could not be flushed",
                    result.failed
                );
            } else {
                log_info!("flushed {} residual bytes at shutdown", result.processed);
            }
        }
    }

    /// `get_detailed_status` (spec.md §4.7): a JSON snapshot of uptime,
    /// running totals, and connection counts by category.
    pub fn get_detailed_status(&self) -> String {
        let snapshot = self.stats.running_snapshot();
        let counts = self.pool.counts();

        let status = StatusSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            total_bytes: snapshot.total_bytes,
            batches_processed: snapshot.batches_processed,
            errors: snapshot.errors,
            avg_batch_time_ms: snapshot.avg_batch_time_ms,
            connections: ConnectionStatus {
                available: counts.available,
                in_use: counts.in_use,
                dead: counts.dead,
                resets: snapshot.connection_resets,
                failures: snapshot.connection_failures,
            },
            current_batch_size: self.batch.current_size(),
        };

        serde_json::to_string(&status).unwrap_or_else(|e| {
            log_error!("failed to serialize status snapshot: {}", e);
            "{}".to_string()
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl<C: DbConnection, F: ConnectionFactory<C>> WorkerContext for Context<C, F> {
    fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    fn pool_counts(&self) -> PoolCounts {
        self.pool.counts()
    }

    fn pool_size(&self) -> usize {
        self.pool.pool_size()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[derive(Debug, Serialize)]
struct ConnectionStatus {
    available: usize,
    in_use: usize,
    dead: usize,
    resets: u64,
    failures: u64,
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    uptime_seconds: u64,
    total_bytes: u64,
    batches_processed: u64,
    errors: u64,
    avg_batch_time_ms: f64,
    connections: ConnectionStatus,
    current_batch_size: usize,
}
