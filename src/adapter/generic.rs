//! Generic adapter for a user-configured custom CLI (`AgentKind::Custom`).
//! A custom CLI has no documented event schema, so its capabilities are
//! all false and its parser never resolves a structured event — the
//! supervisor falls back to its idle-quiet heuristic to decide
//! `PromptComplete` for these (see `CompletionStrategy::IdleTimeout`).

use std::collections::HashMap;
use std::path::Path;

use super::{AdapterCapabilities, AgentAdapter, AgentKind, CompletionStrategy};
use crate::config::IDLE_COMPLETION_TIMEOUT;
use crate::supervisor::parser::{AgentEvent, EventParser, LineBuffer};
use maestro_pty::CommandSpec;

#[derive(Debug, Clone)]
pub struct GenericAdapter {
    name: String,
    executable: String,
    args_template: Vec<String>,
}

impl GenericAdapter {
    pub fn new(name: String, executable: String, args_template: Vec<String>) -> Self {
        Self {
            name,
            executable,
            args_template,
        }
    }
}

impl AgentAdapter for GenericAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Custom(self.name.clone())
    }

    fn executable_name(&self) -> &str {
        &self.executable
    }

    fn spawn_argv(&self, cwd: &Path, env: &HashMap<String, String>) -> CommandSpec {
        let mut spec = CommandSpec::new(self.executable.clone(), cwd.to_path_buf())
            .args(self.args_template.clone());
        for (k, v) in env {
            spec = spec.env(k, v);
        }
        spec
    }

    fn resume_argv(
        &self,
        cwd: &Path,
        env: &HashMap<String, String>,
        _upstream_session_id: &str,
    ) -> CommandSpec {
        // No documented resume protocol: a custom CLI always starts fresh.
        self.spawn_argv(cwd, env)
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    fn completion_strategy(&self) -> CompletionStrategy {
        CompletionStrategy::IdleTimeout(IDLE_COMPLETION_TIMEOUT)
    }

    fn new_parser(&self) -> Box<dyn EventParser> {
        Box::new(GenericParser::default())
    }
}

#[derive(Default)]
pub struct GenericParser {
    lines: LineBuffer,
}

impl EventParser for GenericParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        self.lines.push(chunk).into_iter().map(AgentEvent::RawOutput).collect()
    }

    fn finish(&mut self) -> Vec<AgentEvent> {
        self.lines.take_remainder().into_iter().map(AgentEvent::RawOutput).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_kind_carries_the_configured_name() {
        let adapter = GenericAdapter::new("my-cli".into(), "my-cli-bin".into(), vec![]);
        assert_eq!(adapter.kind(), AgentKind::Custom("my-cli".to_string()));
    }

    #[test]
    fn never_reports_structured_capabilities() {
        let adapter = GenericAdapter::new("x".into(), "x".into(), vec![]);
        let caps = adapter.capabilities();
        assert!(!caps.supports_session_id);
        assert!(!caps.supports_usage_stats);
    }

    #[test]
    fn falls_back_to_idle_timeout_completion() {
        let adapter = GenericAdapter::new("x".into(), "x".into(), vec![]);
        assert_eq!(
            adapter.completion_strategy(),
            CompletionStrategy::IdleTimeout(IDLE_COMPLETION_TIMEOUT)
        );
    }
}
