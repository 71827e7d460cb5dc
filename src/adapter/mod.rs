//! Agent adapter registry: per-agent-kind descriptors
//! bundling executable resolution, argv construction, capability flags,
//! and the event parser the supervisor feeds byte chunks into.
//!
//! Each adapter describes a *long-running, PTY-driven* conversation
//! instead of a one-shot `tokio::process::Command` exec: the supervisor
//! owns the process lifecycle, the adapter only supplies configuration
//! and the parser.

pub mod claude_code;
pub mod codex;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod generic;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{MaestroError, Result};
use crate::supervisor::parser::EventParser;
use maestro_pty::CommandSpec;

/// The kind of coding-agent CLI a session is bound to. `Custom` names an
/// arbitrary CLI configured by the user (an executable name plus argv
/// templates), so the registry is never limited to adapters shipped here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
    Aider,
    Custom(String),
}

impl AgentKind {
    pub fn label(&self) -> &str {
        match self {
            AgentKind::ClaudeCode => "claude-code",
            AgentKind::Codex => "codex",
            AgentKind::Aider => "aider",
            AgentKind::Custom(name) => name,
        }
    }
}

/// Capability flags an adapter declares, surfaced to callers so UI and
/// scheduler logic can degrade gracefully.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub supports_session_storage: bool,
    pub supports_session_id: bool,
    pub supports_usage_stats: bool,
    pub supports_cost_tracking: bool,
    pub supports_context_window: bool,
}

/// Which signal an interrupt request sends first. Every adapter escalates
/// through the same SIGTERM/SIGKILL ladder afterwards; this
/// only covers the first, agent-documented signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSignal {
    /// SIGINT to the process group (the default for nearly every CLI).
    Sigint,
    /// Some adapters document SIGTERM as their graceful-stop signal.
    Sigterm,
}

/// How the supervisor decides a dispatched prompt is finished. Adapters whose event stream has a documented terminal event use
/// `Structured` (the default); adapters with no such protocol (the
/// generic/custom-CLI adapter) fall back to `IdleTimeout`, synthesizing
/// `PromptComplete` once output has been quiet for the given duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStrategy {
    Structured,
    IdleTimeout(Duration),
}

/// A per-agent-kind descriptor: how to find the executable, how to build
/// argv for a new or resumed conversation, and how to parse its output.
pub trait AgentAdapter: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Resolve the executable. Honors `PATH` by default; sessions may
    /// override via an explicit path passed in `search_path_override`.
    fn resolve_executable(&self, search_path_override: Option<&Path>) -> Result<PathBuf> {
        resolve_on_path(self.executable_name(), search_path_override)
            .ok_or_else(|| MaestroError::AgentNotFound(self.kind().label().to_string()))
    }

    /// The bare executable name searched for on `PATH` (e.g. `"claude"`).
    fn executable_name(&self) -> &str;

    /// Build the argv for starting a fresh conversation.
    fn spawn_argv(&self, cwd: &Path, env: &HashMap<String, String>) -> CommandSpec;

    /// Build the argv for resuming a conversation the agent previously
    /// assigned `upstream_session_id` to.
    fn resume_argv(
        &self,
        cwd: &Path,
        env: &HashMap<String, String>,
        upstream_session_id: &str,
    ) -> CommandSpec;

    fn capabilities(&self) -> AdapterCapabilities;

    fn interrupt_signal(&self) -> InterruptSignal {
        InterruptSignal::Sigint
    }

    /// How this adapter's conversations signal completion. Most
    /// adapters have a structured terminal event; see [`CompletionStrategy`].
    fn completion_strategy(&self) -> CompletionStrategy {
        CompletionStrategy::Structured
    }

    /// Construct a fresh, stateful parser for one conversation's byte
    /// stream. Parsers are not shared across conversations: adapters like
    /// Claude Code track partial JSON lines across chunk boundaries.
    fn new_parser(&self) -> Box<dyn EventParser>;
}

/// Search `PATH` (or an explicit override directory) for `name`, resolved
/// eagerly so the supervisor can report `AgentNotFound` before ever
/// spawning a PTY.
fn resolve_on_path(name: &str, search_path_override: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = search_path_override {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(name);
        candidate.is_file().then_some(candidate)
    })
}

/// The set of adapters known to this installation, keyed by kind.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: Arc<DashMap<AgentKind, Arc<dyn AgentAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Arc::new(DashMap::new()),
        }
    }

    /// The registry pre-populated with the adapters shipped in this crate
    /// (Claude Code, Codex, and the generic/custom-CLI adapter).
    pub fn with_builtin_adapters() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(claude_code::ClaudeCodeAdapter::default()));
        registry.register(Arc::new(codex::CodexAdapter::default()));
        registry
    }

    pub fn register(&self, adapter: Arc<dyn AgentAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: &AgentKind) -> Result<Arc<dyn AgentAdapter>> {
        self.adapters
            .get(kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MaestroError::UnknownAgent(kind.label().to_string()))
    }

    pub fn list(&self) -> Vec<AgentKind> {
        self.adapters.iter().map(|e| e.key().clone()).collect()
    }

    /// Register (or look up) a user-configured custom CLI adapter on the
    /// fly, so `AgentKind::Custom` never requires a restart to register.
    pub fn register_custom(&self, name: &str, executable: String, args_template: Vec<String>) {
        let adapter = generic::GenericAdapter::new(name.to_string(), executable, args_template);
        self.register(Arc::new(adapter));
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtin_adapters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_agent_kind_errors() {
        let registry = AdapterRegistry::new();
        let err = registry.get(&AgentKind::Aider).unwrap_err();
        assert_eq!(err.tag(), "UnknownAgent");
    }

    #[test]
    fn builtin_adapters_are_registered() {
        let registry = AdapterRegistry::with_builtin_adapters();
        assert!(registry.get(&AgentKind::ClaudeCode).is_ok());
        assert!(registry.get(&AgentKind::Codex).is_ok());
    }

    #[test]
    fn resolve_on_path_finds_a_real_binary() {
        // `sh` exists on every unix CI/dev box this crate targets.
        let found = resolve_on_path("sh", None);
        assert!(found.is_some());
    }
}
