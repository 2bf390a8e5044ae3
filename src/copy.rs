//! Bulk-copy driver (spec.md §4.5): the chunked streaming/backpressure loop
//! shared by every `DbConnection` implementation, and the `flush` operation
//! that ties the batch accumulator, pool, and stats tracker together.

use crate::batch::BatchAccumulator;
use crate::consts::{BACKPRESSURE_ABORT_THRESHOLD, MAX_BACKOFF_EXPONENT, PROGRESS_LOG_INTERVAL_BYTES};
use crate::pool::connection::{ChunkResult, ChunkWriter, ConnectionFactory, DbConnection};
use crate::pool::ConnectionPool;
use crate::stats::StatsTracker;
use crate::{log_debug, log_error};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ChunkLoopResult {
    pub bytes_written: u64,
    pub aborted: bool,
    pub abort_reason: Option<String>,
}

/// Streams `data` through `writer` in `chunk_size` pieces, honoring the
/// `{Written, Backpressure, Error}` contract: `Backpressure` retries the same
/// chunk after an exponential sleep (capped), `Error` aborts immediately, and
/// more than `BACKPRESSURE_ABORT_THRESHOLD` consecutive `Backpressure`
/// results aborts the stream.
pub fn drive_chunks(writer: &mut dyn ChunkWriter, data: &[u8], chunk_size: usize) -> ChunkLoopResult {
    let mut offset = 0usize;
    let mut consecutive_backpressure: u32 = 0;
    let mut last_logged_at: u64 = 0;

    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        match writer.put_chunk(&data[offset..end]) {
            ChunkResult::Written => {
                offset = end;
                consecutive_backpressure = 0;
                let written = offset as u64;
                if written - last_logged_at >= PROGRESS_LOG_INTERVAL_BYTES {
                    log_debug!("bulk copy progress: {} bytes written", written);
                    last_logged_at = written;
                }
            }
            ChunkResult::Backpressure => {
                writer.drain_inbound();
                consecutive_backpressure += 1;
                if consecutive_backpressure > BACKPRESSURE_ABORT_THRESHOLD {
                    log_error!(
                        "bulk copy aborted: {} consecutive backpressure events exceeds threshold {}",
                        consecutive_backpressure,
                        BACKPRESSURE_ABORT_THRESHOLD
                    );
                    return ChunkLoopResult {
                        bytes_written: offset as u64,
                        aborted: true,
                        abort_reason: Some("backpressure exhausted".to_string()),
                    };
                }
                let backoff_ms = 1u64 << consecutive_backpressure.min(MAX_BACKOFF_EXPONENT);
                std::thread::sleep(Duration::from_millis(backoff_ms));
            }
            ChunkResult::Error => {
                log_error!("bulk copy chunk write failed at offset {}", offset);
                return ChunkLoopResult {
                    bytes_written: offset as u64,
                    aborted: true,
                    abort_reason: Some("chunk write error".to_string()),
                };
            }
        }
    }

    ChunkLoopResult {
        bytes_written: data.len() as u64,
        aborted: false,
        abort_reason: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    pub processed: u64,
    pub failed: u64,
    pub ok: bool,
}

/// The orchestration half of the bulk-copy driver: drains the batch buffer,
/// acquires a connection, runs the copy, updates stats, and always resets the
/// buffer position — even when acquisition or the copy itself fails.
pub fn flush<C, F>(batch: &BatchAccumulator, pool: &ConnectionPool<C, F>, stats: &StatsTracker) -> FlushResult
where
    C: DbConnection,
    F: ConnectionFactory<C>,
{
    let started = Instant::now();
    let data = batch.take_for_flush();
    if data.is_empty() {
        return FlushResult {
            processed: 0,
            failed: 0,
            ok: true,
        };
    }

    let mut pooled = match pool.acquire() {
        Ok(pooled) => pooled,
        Err(e) => {
            log_error!("flush failed to acquire a connection: {}", e);
            let elapsed_ms = started.elapsed().as_millis() as u64;
            stats.record_batch(0, data.len() as u64, elapsed_ms);
            return FlushResult {
                processed: 0,
                failed: data.len() as u64,
                ok: false,
            };
        }
    };

    let outcome = pooled.run_bulk_copy(&data);

    if outcome.mark_dead_immediately {
        pool.mark_dead(pooled.slot_id(), outcome.reason.as_deref().unwrap_or("bulk copy failure"));
    }
    if !outcome.ok {
        pooled.mark_error();
    }

    let failed = if outcome.ok {
        0
    } else {
        (data.len() as u64).saturating_sub(outcome.bytes_written)
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    stats.record_batch(outcome.bytes_written, failed, elapsed_ms);

    FlushResult {
        processed: outcome.bytes_written,
        failed,
        ok: outcome.ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedWriter {
        script: Vec<ChunkResult>,
        step: usize,
        drains: u32,
    }

    impl ChunkWriter for ScriptedWriter {
        fn put_chunk(&mut self, _data: &[u8]) -> ChunkResult {
            let result = self.script.get(self.step).copied().unwrap_or(ChunkResult::Written);
            self.step += 1;
            result
        }
        fn drain_inbound(&mut self) {
            self.drains += 1;
        }
    }

    #[test]
    fn all_written_consumes_everything() {
        let mut writer = ScriptedWriter {
            script: vec![ChunkResult::Written; 4],
            step: 0,
            drains: 0,
        };
        let result = drive_chunks(&mut writer, &[0u8; 40], 10);
        assert_eq!(result.bytes_written, 40);
        assert!(!result.aborted);
    }

    #[test]
    fn error_aborts_at_current_offset() {
        let mut writer = ScriptedWriter {
            script: vec![ChunkResult::Written, ChunkResult::Written, ChunkResult::Error],
            step: 0,
            drains: 0,
        };
        let result = drive_chunks(&mut writer, &[0u8; 40], 10);
        assert_eq!(result.bytes_written, 20);
        assert!(result.aborted);
        assert_eq!(result.abort_reason.as_deref(), Some("chunk write error"));
    }

    #[test]
    fn backpressure_retries_same_chunk_until_written() {
        let mut writer = ScriptedWriter {
            script: vec![ChunkResult::Backpressure, ChunkResult::Backpressure, ChunkResult::Written],
            step: 0,
            drains: 0,
        };
        let result = drive_chunks(&mut writer, &[0u8; 10], 10);
        assert_eq!(result.bytes_written, 10);
        assert!(!result.aborted);
        assert_eq!(writer.drains, 2);
    }

    #[test]
    fn backpressure_exhaustion_aborts() {
        let script = vec![ChunkResult::Backpressure; 7];
        let mut writer = ScriptedWriter {
            script,
            step: 0,
            drains: 0,
        };
        let result = drive_chunks(&mut writer, &[0u8; 10], 10);
        assert!(result.aborted);
        assert_eq!(result.abort_reason.as_deref(), Some("backpressure exhausted"));
        assert_eq!(result.bytes_written, 0);
    }
}
