//! The `DbConnection` abstraction the pool and bulk-copy driver are built
//! against, so both can be exercised by a test double without a live
//! Postgres server (spec.md §4.3, §4.5).

/// Outcome of streaming one chunk into an open bulk-copy operation, modeled
/// on libpq's `PQputCopyData` tri-state (1 / 0 / -1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkResult {
    Written,
    Backpressure,
    Error,
}

/// A thin seam over the protocol driver's copy-in writer, so the chunked
/// streaming/backpressure loop (`crate::copy::drive_chunks`) is shared between
/// the production and test implementations.
pub trait ChunkWriter {
    fn put_chunk(&mut self, data: &[u8]) -> ChunkResult;
    /// Drains whatever inbound protocol state accumulated during a
    /// backpressure pause before the next `put_chunk` retry.
    fn drain_inbound(&mut self);
}

/// Result of one `run_bulk_copy` call. `bytes_written` counts bytes
/// successfully streamed to the wire, not necessarily bytes durably
/// committed — see `DESIGN.md` for the reconciliation of spec.md's two
/// descriptions of the `failed` field.
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub bytes_written: u64,
    pub ok: bool,
    /// Set when this failure indicates the connection itself is unusable and
    /// the slot must transition to `DEAD` immediately, rather than merely
    /// accumulating toward `DEAD_THRESHOLD` via the ordinary release path.
    pub mark_dead_immediately: bool,
    pub reason: Option<String>,
}

impl CopyOutcome {
    pub fn success(bytes: u64) -> Self {
        CopyOutcome {
            bytes_written: bytes,
            ok: true,
            mark_dead_immediately: false,
            reason: None,
        }
    }

    pub fn fatal(bytes_written: u64, reason: impl Into<String>) -> Self {
        CopyOutcome {
            bytes_written,
            ok: false,
            mark_dead_immediately: true,
            reason: Some(reason.into()),
        }
    }

    /// A failure that does not necessarily indict the connection (e.g. a
    /// commit-time failure unrelated to transport health).
    pub fn soft_failure(bytes_written: u64, reason: impl Into<String>) -> Self {
        CopyOutcome {
            bytes_written,
            ok: false,
            mark_dead_immediately: false,
            reason: Some(reason.into()),
        }
    }
}

/// A single pooled database connection capable of running the bulk-copy
/// protocol described in spec.md §4.5.
pub trait DbConnection: Send + std::fmt::Debug {
    fn is_healthy(&self) -> bool;
    fn has_secure_session(&self) -> bool;
    fn prepare_bulk_copy(&mut self) -> Result<(), String>;
    fn run_bulk_copy(&mut self, data: &[u8]) -> CopyOutcome;
}

/// Produces fresh `DbConnection`s for the pool to open at startup and during
/// recovery. Blanket-implemented for any matching closure.
pub trait ConnectionFactory<C: DbConnection>: Send + Sync {
    fn connect(&self) -> Result<C, String>;
}

impl<C, F> ConnectionFactory<C> for F
where
    C: DbConnection,
    F: Fn() -> Result<C, String> + Send + Sync,
{
    fn connect(&self) -> Result<C, String> {
        self()
    }
}
