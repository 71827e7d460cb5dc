//! Test-only adapter that plays back a scripted event sequence instead of
//! driving a real agent CLI. Exercised through the same PTY/supervisor path
//! as every other adapter (a real `sh` child is spawned) so integration
//! tests cover dispatch, streaming, and completion end to end without
//! depending on `claude`/`codex` being installed on the test host.
//!
//! Only compiled for tests (`cfg(test)`) or when a consumer opts in via the
//! `test-util` feature, the way `tokio`'s own test helpers are gated.

use std::collections::HashMap;
use std::path::Path;

use super::{AdapterCapabilities, AgentAdapter, AgentKind, CompletionStrategy, InterruptSignal};
use crate::supervisor::parser::{AgentEvent, EventParser, LineBuffer};
use maestro_pty::CommandSpec;

/// One line of scripted output a [`FakeAdapter`] child process prints in
/// order, read back by [`FakeParser`] into the matching [`AgentEvent`].
#[derive(Debug, Clone)]
pub enum ScriptLine {
    Text(String),
    SessionId(String),
    Done,
    Error { message: String, recoverable: bool },
    /// A pause before the next line, in milliseconds — gives a test a
    /// deterministic window to observe the tab mid-flight (queue a second
    /// prompt, send an interrupt) before the script finishes.
    Sleep(u64),
    /// Ignore SIGINT/SIGTERM for the remainder of the script, simulating an
    /// agent that does not exit on the supervisor's first interrupt signal
    /// and must be escalated to SIGKILL.
    IgnoreSignals,
}

impl ScriptLine {
    fn to_shell_command(&self) -> String {
        match self {
            ScriptLine::Text(s) => shell_print(&format!("__TEXT__:{s}")),
            ScriptLine::SessionId(id) => shell_print(&format!("__SESSION__:{id}")),
            ScriptLine::Done => shell_print("__DONE__"),
            ScriptLine::Error { message, recoverable } => {
                shell_print(&format!("__ERROR__:{}:{}", *recoverable as u8, message))
            }
            ScriptLine::Sleep(ms) => format!("sleep {}", *ms as f64 / 1000.0),
            ScriptLine::IgnoreSignals => "trap '' INT TERM".to_string(),
        }
    }
}

fn shell_print(line: &str) -> String {
    format!("printf '%s\\n' '{}'", line.replace('\'', "'\\''"))
}

/// An adapter whose "agent" is a scripted shell one-liner rather than a
/// real CLI, for exercising the supervisor and scheduler without a network
/// dependency or an installed agent binary.
#[derive(Debug, Clone)]
pub struct FakeAdapter {
    name: String,
    script: Vec<ScriptLine>,
}

impl FakeAdapter {
    pub fn new(name: impl Into<String>, script: Vec<ScriptLine>) -> Self {
        Self { name: name.into(), script }
    }

    fn shell_script(&self) -> String {
        self.script.iter().map(ScriptLine::to_shell_command).collect::<Vec<_>>().join("; ")
    }
}

impl AgentAdapter for FakeAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Custom(self.name.clone())
    }

    fn executable_name(&self) -> &str {
        "sh"
    }

    fn spawn_argv(&self, cwd: &Path, env: &HashMap<String, String>) -> CommandSpec {
        let mut spec = CommandSpec::new("sh", cwd.to_path_buf()).arg("-c").arg(self.shell_script());
        for (k, v) in env {
            spec = spec.env(k, v);
        }
        spec
    }

    fn resume_argv(&self, cwd: &Path, env: &HashMap<String, String>, _upstream_session_id: &str) -> CommandSpec {
        self.spawn_argv(cwd, env)
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

    fn interrupt_signal(&self) -> InterruptSignal {
        InterruptSignal::Sigint
    }

    fn completion_strategy(&self) -> CompletionStrategy {
        CompletionStrategy::Structured
    }

    fn new_parser(&self) -> Box<dyn EventParser> {
        Box::new(FakeParser::default())
    }
}

#[derive(Default)]
pub struct FakeParser {
    lines: LineBuffer,
}

impl EventParser for FakeParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        self.lines.push(chunk).iter().filter_map(|line| parse_line(line)).collect()
    }

    fn finish(&mut self) -> Vec<AgentEvent> {
        self.lines.take_remainder().as_deref().and_then(parse_line).into_iter().collect()
    }
}

fn parse_line(line: &str) -> Option<AgentEvent> {
    if let Some(text) = line.strip_prefix("__TEXT__:") {
        Some(AgentEvent::ResponseToken(text.to_string()))
    } else if let Some(id) = line.strip_prefix("__SESSION__:") {
        Some(AgentEvent::AgentSessionIdAssigned(id.to_string()))
    } else if line == "__DONE__" {
        Some(AgentEvent::PromptComplete)
    } else if let Some(rest) = line.strip_prefix("__ERROR__:") {
        let (recoverable, message) = rest.split_once(':')?;
        Some(AgentEvent::AgentError {
            kind: crate::error::AgentErrorKind::Reported,
            message: message.to_string(),
            recoverable: recoverable == "1",
        })
    } else if line.is_empty() {
        None
    } else {
        Some(AgentEvent::RawOutput(line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_done_line_round_trips_through_the_parser() {
        let mut parser = FakeParser::default();
        let events = parser.feed(b"__TEXT__:hello\n__DONE__\n");
        assert_eq!(events, vec![AgentEvent::ResponseToken("hello".to_string()), AgentEvent::PromptComplete]);
    }

    #[test]
    fn shell_script_escapes_embedded_quotes() {
        let adapter = FakeAdapter::new("fake", vec![ScriptLine::Text("it's fine".to_string())]);
        assert!(adapter.shell_script().contains(r"it'\''s fine"));
    }
}
