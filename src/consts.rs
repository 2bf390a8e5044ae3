//! Internal tuning knobs that are not part of the user-facing [`crate::config::Config`].
//!
//! spec.md names these constants generically (`DEAD_THRESHOLD`, `MAX_RECOVERY_ATTEMPTS`,
//! `POOL_SIZE`, ...) without pinning exact values; the ones below are this
//! implementation's choice, recorded in `DESIGN.md`.

use std::time::Duration;

/// Number of connections the pool maintains for the lifetime of the process.
pub const POOL_SIZE: usize = 4;

/// Consecutive failed releases before a slot transitions `IN_USE -> DEAD`.
pub const DEAD_THRESHOLD: u32 = 3;

/// Recovery attempts after which a `DEAD` slot is quarantined permanently.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 5;

/// Exponent cap applied to both recovery backoff and bulk-copy backpressure backoff.
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Base recovery backoff, doubled per attempt up to [`MAX_BACKOFF_EXPONENT`].
pub const RECOVERY_BACKOFF_BASE_MS: u64 = 500;

/// How long a single `acquire()` pass waits on the pool condition variable before
/// giving up.
pub const ACQUIRE_WAIT: Duration = Duration::from_secs(1);

/// Fixed size of the batch-stats ring buffer.
pub const STATS_RING_SIZE: usize = 1000;

/// Bulk-copy chunk size streamed per `put_chunk` call.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Consecutive `BACKPRESSURE` results after which a flush aborts and marks its
/// connection dead.
pub const BACKPRESSURE_ABORT_THRESHOLD: u32 = 5;

/// How often bulk-copy progress is logged at DEBUG, in bytes.
pub const PROGRESS_LOG_INTERVAL_BYTES: u64 = 1024 * 1024;

/// Number of background health/stats worker threads started by default.
pub const DEFAULT_NUM_WORKERS: usize = 2;

/// Worker loop: how often a stats heartbeat is emitted.
pub const WORKER_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Worker loop: how often the shutdown flag / pool health is re-checked.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default batch capacity, 1 MiB.
pub const DEFAULT_BATCH_CAPACITY_BYTES: u64 = 1024 * 1024;

/// Minimum accepted batch capacity, 64 KiB.
pub const MIN_BATCH_CAPACITY_BYTES: u64 = 64 * 1024;

/// Maximum accepted batch capacity, 10 MiB.
pub const MAX_BATCH_CAPACITY_BYTES: u64 = 10 * 1024 * 1024;

/// `max_retries` default, preserved in [`crate::config::Config`] but unused by the
/// core pipeline itself (spec.md §3).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// `retry_delay_ms` default, preserved in [`crate::config::Config`] but unused by the
/// core pipeline itself (spec.md §3).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// The bulk-copy prepared statement text. Must be byte-identical on every slot
/// (spec.md §8, testable property 6).
pub const BULK_COPY_STATEMENT: &str =
    "COPY original_copy(source_id, content, seq_num, checksum) FROM STDIN WITH (FORMAT binary)";

/// Maximum length `last_error` is truncated to before being stored on a slot.
pub const LAST_ERROR_MAX_LEN: usize = 256;

/// Truncates an error message to [`LAST_ERROR_MAX_LEN`] bytes on a `char` boundary.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= LAST_ERROR_MAX_LEN {
        return message.to_string();
    }
    let mut end = LAST_ERROR_MAX_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
