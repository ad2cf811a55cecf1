//! Bounded, classified capture of bridge process output.

use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use crate::codec::now_millis;

/// Maximum retained entries; the oldest is evicted first.
pub const LOG_CAPACITY: usize = 100;

/// Stderr lines that look alarming but are ordinary startup/progress chatter.
const BENIGN_MARKERS: &[&str] = &[
    "DeprecationWarning",
    "UserWarning",
    "FutureWarning",
    "warnings.warn",
    "Loading model",
    "Downloading",
    "Creating model",
    "model files",
    "Connectivity check",
    "it/s]",
    "s/it]",
    "%|",
    "Uvicorn running",
    "Started server process",
    "Waiting for application startup",
    "Application startup complete",
    "Warmup warning",
];

/// Line prefixes of ordinary server logging.
const BENIGN_PREFIXES: &[&str] = &["INFO:", "DEBUG:"];

/// Substrings that mark a stderr line as a real failure.
const ERROR_MARKERS: &[&str] = &["error", "exception", "traceback", "failed", "❌"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// Stream a raw line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: u64,
}

/// Ring buffer of classified log lines, shared between the supervisor and
/// its stdout/stderr reader tasks.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            level,
            message: message.into(),
            timestamp: now_millis(),
        };
        let mut buf = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if buf.len() >= LOG_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("[bridge] {}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("[bridge] {}", message);
        self.push(LogLevel::Error, message);
    }

    /// Classify and record one raw line of process output.
    pub fn record_line(&self, source: Source, raw: &str) {
        let line = strip_ansi(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match classify(source, line) {
            LogLevel::Info => {
                tracing::debug!("[bridge] {}", line);
                self.push(LogLevel::Info, line);
            }
            LogLevel::Error => {
                tracing::warn!("[bridge] {}", line);
                self.push(LogLevel::Error, line);
            }
        }
    }

    /// Read-then-clear. Concurrent readers each get a disjoint slice.
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut buf = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Level of a line given the stream it arrived on.
///
/// A line opening with a traceback or a raised `...Error:` / `...Exception:`
/// is an error even when it mentions a benign marker further on.
pub fn classify(source: Source, line: &str) -> LogLevel {
    static FAILURE: OnceLock<Regex> = OnceLock::new();
    match source {
        Source::Stdout => LogLevel::Info,
        Source::Stderr => {
            let failure = FAILURE.get_or_init(|| {
                Regex::new(r"^(Traceback\b|[\w.]*(Error|Exception):)").expect("valid failure regex")
            });
            if failure.is_match(line) {
                return LogLevel::Error;
            }
            if BENIGN_PREFIXES.iter().any(|p| line.starts_with(p))
                || BENIGN_MARKERS.iter().any(|m| line.contains(m))
            {
                return LogLevel::Info;
            }
            let lower = line.to_lowercase();
            if ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
                LogLevel::Error
            } else {
                LogLevel::Info
            }
        }
    }
}

/// Remove ANSI escape sequences (colors, cursor movement).
pub fn strip_ansi(line: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid ANSI regex")
    });
    re.replace_all(line, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_keeps_last_100() {
        let logs = LogBuffer::new();
        for i in 0..150 {
            logs.push(LogLevel::Info, format!("line {}", i));
        }
        assert_eq!(logs.len(), LOG_CAPACITY);

        let entries = logs.drain();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries.first().unwrap().message, "line 50");
        assert_eq!(entries.last().unwrap().message, "line 149");
    }

    #[test]
    fn test_drain_clears() {
        let logs = LogBuffer::new();
        logs.info("hello");
        assert_eq!(logs.drain().len(), 1);
        assert!(logs.drain().is_empty());
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[32mINFO\x1b[0m ready"), "INFO ready");
        assert_eq!(strip_ansi("\x1b[2K\x1b[1Gplain"), "plain");
        assert_eq!(strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn test_classify_streams() {
        assert_eq!(classify(Source::Stdout, "❌ Initialization Error"), LogLevel::Info);
        assert_eq!(classify(Source::Stderr, "model warming up"), LogLevel::Info);
        assert_eq!(
            classify(Source::Stderr, "Traceback (most recent call last):"),
            LogLevel::Error
        );
        assert_eq!(
            classify(Source::Stderr, "RuntimeError: CUDA out of memory"),
            LogLevel::Error
        );
    }

    #[test]
    fn test_classify_benign_stderr() {
        let benign = [
            "INFO:     Uvicorn running on http://127.0.0.1:5000",
            "DeprecationWarning: error_handler is deprecated",
            "Downloading model files: 45%|████▌     | 9/20",
            "UserWarning: failed to load optional codec, falling back",
        ];
        for line in benign {
            assert_eq!(classify(Source::Stderr, line), LogLevel::Info, "{line}");
        }
    }

    #[test]
    fn test_raised_errors_beat_benign_markers() {
        let failures = [
            "RuntimeError: failed to download model weights",
            "OSError: Error while Loading checkpoint",
            "Exception: INFO: bad",
            "paddle.base.core.PreconditionNotMetError: Downloading weights failed",
        ];
        for line in failures {
            assert_eq!(classify(Source::Stderr, line), LogLevel::Error, "{line}");
        }
        assert_eq!(
            classify(Source::Stderr, "could not download model weights: failed"),
            LogLevel::Error
        );
    }

    #[test]
    fn test_record_line_strips_and_skips_blank() {
        let logs = LogBuffer::new();
        logs.record_line(Source::Stderr, "\x1b[31mValueError: bad image\x1b[0m");
        logs.record_line(Source::Stdout, "   ");
        let entries = logs.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert_eq!(entries[0].message, "ValueError: bad image");
    }
}
