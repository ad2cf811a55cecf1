//! Line-delimited progress protocol shared by providers, orchestrator and
//! the HTTP boundary.
//!
//! Every frame is one JSON object terminated by `\n`:
//!
//! ```text
//! {"type":"log","tag":"cloud_vision","message":"...","timestamp":1700000000000}
//! {"type":"error","message":"..."}
//! {"type":"final","event":{...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// One unit of the outbound streaming protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Log {
        tag: String,
        message: String,
        timestamp: u64,
    },
    Error {
        message: String,
    },
    Final {
        event: Value,
    },
}

impl Frame {
    pub fn log(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Frame::Log {
            tag: tag.into(),
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    pub fn final_event(event: Value) -> Self {
        Frame::Final { event }
    }

    /// `error` and `final` end a stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Frame::Log { .. })
    }

    /// Tag of a `log` frame.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Frame::Log { tag, .. } => Some(tag),
            _ => None,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Encode a frame as one newline-terminated JSON line.
///
/// String values are JSON-escaped, so a line never contains an embedded
/// newline.
pub fn encode(frame: &Frame) -> String {
    let mut line = serde_json::to_string(frame).unwrap_or_else(|e| {
        // Only reachable for non-string map keys inside `event`.
        format!(
            r#"{{"type":"error","message":"Failed to encode frame: {}"}}"#,
            e.to_string().replace('"', "'")
        )
    });
    line.push('\n');
    line
}

/// Decode one line into a frame. Lines that are not valid frame JSON are
/// dropped.
pub fn decode(line: &str) -> Option<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Payload of an SSE `data:` line. Other framing lines (`event:`, `id:`,
/// comments, blanks) yield `None`.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Chunked-line reassembly.
///
/// Bytes are buffered until a `\n` arrives; the trailing fragment is kept
/// for the next chunk. Buffering is byte-wise so a UTF-8 sequence split
/// across chunks is rebuilt intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(to_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flush the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = to_line(&raw);
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

fn to_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
