//! Process-wide structured logger.
//!
//! This is Hydrant's only logging mechanism — there is no `tracing`/`log`
//! facade layered on top. spec.md §4.1 pins the wire format exactly (one JSON
//! object per line, keys `timestamp`, `level`, `message`, `thread`), so the
//! logger owns its own formatter rather than delegating to a generic one.

use chrono::Local;
use std::fmt::Write as _;
use std::io::{self, Write as _};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Serializes all writes behind a single lock so concurrent `emit` calls never
/// interleave partial lines.
#[derive(Debug)]
pub struct Logger {
    write_lock: Mutex<()>,
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Logger = Logger::new();
}

impl Logger {
    fn new() -> Self {
        Logger {
            write_lock: Mutex::new(()),
        }
    }

    pub fn global() -> &'static Logger {
        &GLOBAL_LOGGER
    }

    /// Emits one JSON-line record to stderr. Write failures are dropped
    /// silently — a full disk or broken pipe on the log stream must not take
    /// down the ingestion pipeline.
    pub fn emit(&self, level: Level, message: &str) {
        let thread_name = std::thread::current()
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{:?}", std::thread::current().id()));
        let timestamp = Local::now().to_rfc3339();

        let mut line = String::with_capacity(message.len() + 64);
        line.push_str("{\"timestamp\":\"");
        escape_into(&timestamp, &mut line);
        line.push_str("\",\"level\":\"");
        line.push_str(level.as_str());
        line.push_str("\",\"message\":\"");
        escape_into(message, &mut line);
        line.push_str("\",\"thread\":\"");
        escape_into(&thread_name, &mut line);
        line.push_str("\"}\n");

        let guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stderr = io::stderr();
        if stderr.write_all(line.as_bytes()).is_err() {
            return;
        }
        let _ = stderr.flush();
        drop(guard);
    }
}

/// Escapes `"`, `\`, newline, carriage return, tab, and any remaining control
/// byte below `0x20` as `\u00XX`; everything else is copied through verbatim
/// (including multi-byte UTF-8, since `message` is already a valid `&str`).
fn escape_into(input: &str, out: &mut String) {
    for ch in input.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::Logger::global().emit($crate::logging::Level::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::Logger::global().emit($crate::logging::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::Logger::global().emit($crate::logging::Level::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::Logger::global().emit($crate::logging::Level::Error, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_and_quote_characters() {
        let mut out = String::new();
        escape_into("line1\nline2\t\"quoted\"\\back", &mut out);
        assert_eq!(out, "line1\\nline2\\t\\\"quoted\\\"\\\\back");
    }

    #[test]
    fn escapes_low_control_bytes_as_unicode_escapes() {
        let mut out = String::new();
        escape_into("\u{0001}\u{0007}", &mut out);
        assert_eq!(out, "\\u0001\\u0007");
    }

    #[test]
    fn preserves_multibyte_utf8() {
        let mut out = String::new();
        escape_into("caf\u{00e9}", &mut out);
        assert_eq!(out, "caf\u{00e9}");
    }

    #[test]
    fn emit_does_not_panic_under_concurrent_access() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    for j in 0..20 {
                        log_info!("worker {} iteration {}", i, j);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
