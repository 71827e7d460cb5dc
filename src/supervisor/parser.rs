//! Per-adapter event-stream parsing.
//!
//! Each adapter owns a parser instance for the lifetime of one
//! conversation. Parsers are fed raw byte chunks as they arrive from the
//! PTY and emit zero or more structured [`AgentEvent`]s; any bytes that
//! don't resolve to a structured event come back as `RawOutput` so the
//! supervisor can still append them to the tab's log as plain stdout.

use serde::{Deserialize, Serialize};

use crate::error::AgentErrorKind;

/// Usage/cost statistics reported by an agent that supports them
/// (`supportsUsageStats`/`supportsCostTracking`/`supportsContextWindow`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub context_window_tokens: Option<u64>,
}

/// A structured event extracted from an agent's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentEvent {
    /// A chunk of the agent's response text, as a structured token rather
    /// than opaque passthrough (e.g. a `content` field in a JSON event).
    ResponseToken(String),
    /// Bytes not recognized as part of any structured event; appended to
    /// the tab's log via the streaming-coalescence rule.
    RawOutput(String),
    /// Tool invocation metadata (file edits, shell commands, etc).
    ToolUse(serde_json::Value),
    UsageUpdate(UsageStats),
    /// The agent assigned (or re-confirmed) its own conversation id.
    AgentSessionIdAssigned(String),
    /// The agent finished responding to the current prompt.
    PromptComplete,
    AgentError {
        kind: AgentErrorKind,
        message: String,
        recoverable: bool,
    },
}

/// Stateful per-conversation parser. Implementations buffer partial lines
/// across chunk boundaries (a PTY read can split a JSON line anywhere).
pub trait EventParser: Send {
    fn feed(&mut self, chunk: &[u8]) -> Vec<AgentEvent>;

    /// Called once the child has exited, to flush any buffered partial
    /// data as best-effort raw output rather than silently dropping it.
    fn finish(&mut self) -> Vec<AgentEvent> {
        Vec::new()
    }
}

/// Accumulates raw bytes and yields complete UTF-8 lines, tolerating
/// chunk boundaries that split a line or a multi-byte character.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        loop {
            let Some(pos) = self.pending.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            lines.push(line);
        }
        lines
    }

    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let remainder = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(remainder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_on_newline_across_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"hel").is_empty());
        let lines = buf.push(b"lo\nworld\npart");
        assert_eq!(lines, vec!["hello".to_string(), "world".to_string()]);
        assert_eq!(buf.take_remainder(), Some("part".to_string()));
        assert_eq!(buf.take_remainder(), None);
    }
}
