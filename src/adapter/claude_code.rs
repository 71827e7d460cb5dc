//! Claude Code adapter: argv construction and JSON-stream parsing.
//!
//! Builds the same flags a one-shot CLI invocation would (`-p`, `--json`,
//! `--dangerously-skip-permissions`, `--think`, `--model`) but targets PTY
//! spawn/resume argv plus a standing stream parser, since the engine
//! drives Claude Code as a long-lived interactive conversation rather
//! than a single `tokio::process::Command` exec.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use super::{AdapterCapabilities, AgentAdapter, AgentKind};
use crate::error::AgentErrorKind;
use crate::supervisor::parser::{AgentEvent, EventParser, LineBuffer, UsageStats};
use maestro_pty::CommandSpec;

#[derive(Debug, Clone)]
pub struct ClaudeCodeAdapter {
    pub model: Option<String>,
    pub think_mode: Option<String>,
    pub dangerously_skip_permissions: bool,
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self {
            model: None,
            think_mode: None,
            dangerously_skip_permissions: false,
        }
    }
}

impl AgentAdapter for ClaudeCodeAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::ClaudeCode
    }

    fn executable_name(&self) -> &str {
        "claude"
    }

    fn spawn_argv(&self, cwd: &Path, env: &HashMap<String, String>) -> CommandSpec {
        let mut spec = CommandSpec::new("claude", cwd.to_path_buf()).arg("--json");
        spec = self.apply_common_flags(spec);
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
        let mut spec = CommandSpec::new("claude", cwd.to_path_buf())
            .arg("--json")
            .arg("--resume")
            .arg(upstream_session_id);
        spec = self.apply_common_flags(spec);
        for (k, v) in env {
            spec = spec.env(k, v);
        }
        spec
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_session_storage: true,
            supports_session_id: true,
            supports_usage_stats: true,
            supports_cost_tracking: true,
            supports_context_window: true,
        }
    }

    fn new_parser(&self) -> Box<dyn EventParser> {
        Box::new(ClaudeCodeParser::default())
    }
}

impl ClaudeCodeAdapter {
    fn apply_common_flags(&self, mut spec: CommandSpec) -> CommandSpec {
        if self.dangerously_skip_permissions {
            spec = spec.arg("--dangerously-skip-permissions");
        }
        if let Some(think) = &self.think_mode {
            spec = spec.arg("--think").arg(think.clone());
        }
        if let Some(model) = &self.model {
            spec = spec.arg("--model").arg(model.clone());
        }
        spec
    }
}

/// Parses Claude Code's `--json` event stream: one JSON object per line.
/// Recognized `type` discriminators map to structured `AgentEvent`s;
/// unparseable lines pass through as `RawOutput`.
#[derive(Default)]
pub struct ClaudeCodeParser {
    lines: LineBuffer,
}

impl EventParser for ClaudeCodeParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        self.lines.push(chunk).into_iter().map(parse_line).collect()
    }

    fn finish(&mut self) -> Vec<AgentEvent> {
        self.lines
            .take_remainder()
            .into_iter()
            .map(|line| parse_line(line))
            .collect()
    }
}

fn parse_line(line: String) -> AgentEvent {
    if line.trim().is_empty() {
        return AgentEvent::RawOutput(line);
    }
    let Ok(value) = serde_json::from_str::<Value>(&line) else {
        return AgentEvent::RawOutput(line);
    };

    match value.get("type").and_then(Value::as_str) {
        Some("text") | Some("content_block_delta") => value
            .get("text")
            .and_then(Value::as_str)
            .map(|t| AgentEvent::ResponseToken(t.to_string()))
            .unwrap_or(AgentEvent::RawOutput(line)),
        Some("tool_use") => AgentEvent::ToolUse(value),
        Some("usage") => AgentEvent::UsageUpdate(UsageStats {
            input_tokens: value.get("input_tokens").and_then(Value::as_u64),
            output_tokens: value.get("output_tokens").and_then(Value::as_u64),
            cost_usd: value.get("cost_usd").and_then(Value::as_f64),
            context_window_tokens: value.get("context_window_tokens").and_then(Value::as_u64),
        }),
        Some("session_id") => value
            .get("session_id")
            .and_then(Value::as_str)
            .map(|id| AgentEvent::AgentSessionIdAssigned(id.to_string()))
            .unwrap_or(AgentEvent::RawOutput(line)),
        Some("result") => AgentEvent::PromptComplete,
        Some("error") => AgentEvent::AgentError {
            kind: AgentErrorKind::Reported,
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("agent reported an error")
                .to_string(),
            recoverable: value
                .get("recoverable")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        },
        _ => AgentEvent::RawOutput(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_argv_includes_json_flag() {
        let adapter = ClaudeCodeAdapter::default();
        let spec = adapter.spawn_argv(Path::new("/tmp"), &HashMap::new());
        assert!(spec.args.contains(&"--json".to_string()));
    }

    #[test]
    fn resume_argv_passes_upstream_id() {
        let adapter = ClaudeCodeAdapter::default();
        let spec = adapter.resume_argv(Path::new("/tmp"), &HashMap::new(), "sess-42");
        assert!(spec.args.contains(&"--resume".to_string()));
        assert!(spec.args.contains(&"sess-42".to_string()));
    }

    #[test]
    fn parses_text_event() {
        let mut parser = ClaudeCodeParser::default();
        let events = parser.feed(b"{\"type\":\"text\",\"text\":\"hello\"}\n");
        assert_eq!(events, vec![AgentEvent::ResponseToken("hello".to_string())]);
    }

    #[test]
    fn parses_session_id_and_result() {
        let mut parser = ClaudeCodeParser::default();
        let events = parser.feed(b"{\"type\":\"session_id\",\"session_id\":\"abc\"}\n{\"type\":\"result\"}\n");
        assert_eq!(
            events,
            vec![
                AgentEvent::AgentSessionIdAssigned("abc".to_string()),
                AgentEvent::PromptComplete,
            ]
        );
    }

    #[test]
    fn non_json_line_is_raw_output() {
        let mut parser = ClaudeCodeParser::default();
        let events = parser.feed(b"plain text\n");
        assert_eq!(events, vec![AgentEvent::RawOutput("plain text".to_string())]);
    }
}
