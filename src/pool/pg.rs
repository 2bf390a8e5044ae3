//! Production [`DbConnection`] implementation backed by the synchronous
//! `postgres` crate (not `tokio-postgres` — spec.md §5 mandates OS threads,
//! not cooperative tasks) plus `postgres-native-tls` for the secure-transport
//! check spec.md §4.3/§6 requires.

use crate::consts::{DEFAULT_CHUNK_SIZE, BULK_COPY_STATEMENT};
use crate::copy::drive_chunks;
use crate::pool::connection::{ChunkResult, ChunkWriter, ConnectionFactory, CopyOutcome, DbConnection};
use postgres::CopyInWriter;
use std::io::Write as _;

/// A single live connection plus the prepared bulk-copy statement handle
/// (spec.md §6's `COPY original_copy(...)`), opened once at pool startup or
/// recovery time and reused across flushes until it is marked dead.
pub struct PgConnection {
    client: postgres::Client,
    secure: bool,
    statement: Option<postgres::Statement>,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("secure", &self.secure)
            .field("prepared", &self.statement.is_some())
            .finish()
    }
}

impl PgConnection {
    /// Opens a fresh connection against `database_url`. When
    /// `require_secure_transport` is set, a `native-tls` connector is used
    /// and `has_secure_session` reports `true` on success; otherwise the
    /// connection is opened with `NoTls` and never reports itself secure,
    /// so the pool's startup/recovery health check (spec.md §4.3 step 4)
    /// marks the slot dead rather than silently downgrading transport.
    pub fn connect(database_url: &str, require_secure_transport: bool) -> Result<Self, String> {
        if require_secure_transport {
            let connector = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| format!("failed to build TLS connector: {e}"))?;
            let connector = postgres_native_tls::MakeTlsConnector::new(connector);
            let client = postgres::Client::connect(database_url, connector)
                .map_err(|e| format!("connect failed: {e}"))?;
            Ok(PgConnection {
                client,
                secure: true,
                statement: None,
            })
        } else {
            let client =
                postgres::Client::connect(database_url, postgres::NoTls).map_err(|e| format!("connect failed: {e}"))?;
            Ok(PgConnection {
                client,
                secure: false,
                statement: None,
            })
        }
    }
}

impl DbConnection for PgConnection {
    fn is_healthy(&self) -> bool {
        !self.client.is_closed()
    }

    fn has_secure_session(&self) -> bool {
        self.secure
    }

    fn prepare_bulk_copy(&mut self) -> Result<(), String> {
        let statement = self
            .client
            .prepare(BULK_COPY_STATEMENT)
            .map_err(|e| format!("prepare failed: {e}"))?;
        self.statement = Some(statement);
        Ok(())
    }

    /// Runs the ten-step bulk-copy sequence of spec.md §4.5, steps 2-7: begin
    /// the transaction, start the copy-in, stream chunks via
    /// [`crate::copy::drive_chunks`], finish or cancel the copy-in, and
    /// commit or roll back. Steps 1 (acquire), 8-10 (release, stats, buffer
    /// reset) live one layer up in `crate::copy::flush`.
    fn run_bulk_copy(&mut self, data: &[u8]) -> CopyOutcome {
        let statement = match self.statement.clone() {
            Some(s) => s,
            None => return CopyOutcome::fatal(0, "bulk copy statement was never prepared"),
        };

        let mut transaction = match self.client.transaction() {
            Ok(t) => t,
            Err(e) => return CopyOutcome::fatal(0, format!("begin transaction failed: {e}")),
        };

        let mut writer = match transaction.copy_in(&statement) {
            Ok(w) => w,
            Err(e) => {
                let _ = transaction.rollback();
                return CopyOutcome::fatal(0, format!("copy-in start failed: {e}"));
            }
        };

        let chunk_outcome = {
            let mut chunk_writer = PgChunkWriter { writer: &mut writer };
            drive_chunks(&mut chunk_writer, data, DEFAULT_CHUNK_SIZE)
        };

        if chunk_outcome.aborted {
            // Dropping the writer without `finish()` sends CopyFail,
            // cancelling the in-flight copy server-side.
            drop(writer);
            let _ = transaction.rollback();
            return CopyOutcome::fatal(
                chunk_outcome.bytes_written,
                chunk_outcome.abort_reason.unwrap_or_else(|| "bulk copy aborted".to_string()),
            );
        }

        if let Err(e) = writer.finish() {
            let _ = transaction.rollback();
            return CopyOutcome::fatal(chunk_outcome.bytes_written, format!("copy-in finish failed: {e}"));
        }

        match transaction.commit() {
            Ok(()) => CopyOutcome::success(chunk_outcome.bytes_written),
            Err(e) => CopyOutcome::soft_failure(chunk_outcome.bytes_written, format!("commit failed: {e}")),
        }
    }
}

/// Adapts `postgres::CopyInWriter`'s plain `io::Write` surface to the
/// `{Written, Backpressure, Error}` tri-state `ChunkWriter` contract.
/// `rust-postgres`'s synchronous driver does not itself surface a
/// backpressure signal distinct from a hard I/O error at this layer, so in
/// production `Backpressure` is unreachable here — it is fully exercised via
/// the `DbConnection` test doubles in `crate::pool` and `crate::copy` (see
/// `SPEC_FULL.md` §4.5).
struct PgChunkWriter<'a, 'b> {
    writer: &'a mut CopyInWriter<'b>,
}

impl ChunkWriter for PgChunkWriter<'_, '_> {
    fn put_chunk(&mut self, data: &[u8]) -> ChunkResult {
        match self.writer.write_all(data) {
            Ok(()) => ChunkResult::Written,
            Err(_) => ChunkResult::Error,
        }
    }

    fn drain_inbound(&mut self) {}
}

/// Connects to `database_url` on demand, used as the pool's
/// [`ConnectionFactory`] both at startup and for every recovery attempt.
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    database_url: String,
    require_secure_transport: bool,
}

impl PgConnectionFactory {
    pub fn new(database_url: impl Into<String>, require_secure_transport: bool) -> Self {
        PgConnectionFactory {
            database_url: database_url.into(),
            require_secure_transport,
        }
    }
}

impl ConnectionFactory<PgConnection> for PgConnectionFactory {
    fn connect(&self) -> Result<PgConnection, String> {
        PgConnection::connect(&self.database_url, self.require_secure_transport)
    }
}
