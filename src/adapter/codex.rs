//! Codex adapter. Codex's event stream is newline-delimited JSON with a
//! flatter schema than Claude Code's (`{"msg": "...", "done": bool}`
//! plus an optional `"thread_id"` once assigned) — distinct enough from
//! Claude Code's schema to warrant its own parser rather than sharing one.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use super::{AdapterCapabilities, AgentAdapter, AgentKind};
use crate::error::AgentErrorKind;
use crate::supervisor::parser::{AgentEvent, EventParser, LineBuffer};
use maestro_pty::CommandSpec;

#[derive(Debug, Clone, Default)]
pub struct CodexAdapter {
    pub full_auto: bool,
}

impl AgentAdapter for CodexAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Codex
    }

    fn executable_name(&self) -> &str {
        "codex"
    }

    fn spawn_argv(&self, cwd: &Path, env: &HashMap<String, String>) -> CommandSpec {
        let mut spec = CommandSpec::new("codex", cwd.to_path_buf()).arg("--json");
        if self.full_auto {
            spec = spec.arg("--full-auto");
        }
        for (k, v) in env {
            spec = spec.env(k, v);
        }
        spec
    }

    fn resume_argv(
        &self,
        cwd: &Path,
        env: &HashMap<String, String>,
        upstream_session_id: &str,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new("codex", cwd.to_path_buf())
            .arg("--json")
            .arg("resume")
            .arg(upstream_session_id);
        if self.full_auto {
            spec = spec.arg("--full-auto");
        }
        for (k, v) in env {
            spec = spec.env(k, v);
        }
        spec
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_session_storage: true,
            supports_session_id: true,
            supports_usage_stats: false,
            supports_cost_tracking: false,
            supports_context_window: false,
        }
    }

    fn new_parser(&self) -> Box<dyn EventParser> {
        Box::new(CodexParser::default())
    }
}

#[derive(Default)]
pub struct CodexParser {
    lines: LineBuffer,
}

impl EventParser for CodexParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        self.lines.push(chunk).into_iter().map(parse_line).collect()
    }

    fn finish(&mut self) -> Vec<AgentEvent> {
        self.lines.take_remainder().into_iter().map(parse_line).collect()
    }
}

fn parse_line(line: String) -> AgentEvent {
    let Ok(value) = serde_json::from_str::<Value>(&line) else {
        return AgentEvent::RawOutput(line);
    };

    if let Some(thread_id) = value.get("thread_id").and_then(Value::as_str) {
        return AgentEvent::AgentSessionIdAssigned(thread_id.to_string());
    }
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return AgentEvent::AgentError {
            kind: AgentErrorKind::Reported,
            message: error.to_string(),
            recoverable: true,
        };
    }
    if value.get("done").and_then(Value::as_bool) == Some(true) {
        return AgentEvent::PromptComplete;
    }
    match value.get("msg").and_then(Value::as_str) {
        Some(text) => AgentEvent::ResponseToken(text.to_string()),
        None => AgentEvent::RawOutput(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_and_done() {
        let mut parser = CodexParser::default();
        let events = parser.feed(b"{\"msg\":\"hi\"}\n{\"done\":true}\n");
        assert_eq!(
            events,
            vec![
                AgentEvent::ResponseToken("hi".to_string()),
                AgentEvent::PromptComplete,
            ]
        );
    }

    #[test]
    fn parses_thread_id() {
        let mut parser = CodexParser::default();
        let events = parser.feed(b"{\"thread_id\":\"th-1\"}\n");
        assert_eq!(events, vec![AgentEvent::AgentSessionIdAssigned("th-1".to_string())]);
    }
}
