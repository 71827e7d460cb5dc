//! Engine configuration: the on-disk layout root, tunables (streaming
//! coalescence window, interrupt grace, closed-tab ring size, CLI wait
//! poll interval), and the opaque settings key-value store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResultExt;

/// Environment variable overriding the OS-default configuration directory.
pub const CONFIG_DIR_ENV: &str = "MAESTRO_CONFIG_DIR";

/// Environment variable overriding the gateway's listen port.
pub const REMOTE_PORT_ENV: &str = "MAESTRO_REMOTE_PORT";

/// Streaming-append coalescence window: a stdout append
/// within this long of the previous one is merged into the same log entry.
pub const STDOUT_COALESCE_WINDOW: Duration = Duration::from_secs(5);

/// Grace period between an interrupt signal and escalation.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(10);

/// Bounded size of the per-session closed-tab ring.
pub const CLOSED_TAB_RING_CAPACITY: usize = 25;

/// CLI `--wait` poll interval against the liveness file.
pub const CLI_WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long a custom/unrecognized-protocol adapter's conversation may stay
/// quiet before the supervisor synthesizes `PromptComplete` on its behalf.
/// Real structured adapters (Claude Code, Codex) never rely on this.
pub const IDLE_COMPLETION_TIMEOUT: Duration = Duration::from_secs(20);

/// Backpressure threshold: a remote client whose outbound buffer exceeds
/// this many bytes is dropped rather than memoized against.
pub const REMOTE_CLIENT_BACKPRESSURE_BYTES: usize = 4 * 1024 * 1024;

/// Resolves the OS-specific configuration directory and the fixed set of
/// files/subdirectories the engine persists under it.
#[derive(Debug, Clone)]
pub struct MaestroConfig {
    pub config_dir: PathBuf,
    /// Runtime-tunable override for `STDOUT_COALESCE_WINDOW`, in
    /// milliseconds. Defaults to the constant's value; surfaced so an
    /// installation can widen or disable coalescing without a rebuild.
    pub output_coalesce_window_ms: u64,
}

impl MaestroConfig {
    /// Resolve the configuration directory: `MAESTRO_CONFIG_DIR` if set,
    /// otherwise the OS default (Application Support / AppData /
    /// XDG_CONFIG_HOME) joined with `maestro`.
    pub fn resolve() -> anyhow::Result<Self> {
        let config_dir = match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .ok_or_else(|| anyhow::anyhow!("could not determine OS config directory"))?
                .join("maestro"),
        };
        Ok(Self {
            config_dir,
            output_coalesce_window_ms: STDOUT_COALESCE_WINDOW.as_millis() as u64,
        })
    }

    pub fn output_coalesce_window(&self) -> Duration {
        Duration::from_millis(self.output_coalesce_window_ms)
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.config_dir.join("sessions.json")
    }

    pub fn playbooks_dir(&self) -> PathBuf {
        self.config_dir.join("playbooks")
    }

    pub fn playbook_file(&self, session_id: &str) -> PathBuf {
        self.playbooks_dir().join(format!("{session_id}.json"))
    }

    pub fn history_dir(&self) -> PathBuf {
        self.config_dir.join("history")
    }

    pub fn history_file(&self, workspace_path: &Path) -> PathBuf {
        let hash = workspace_hash(workspace_path);
        self.history_dir().join(format!("{hash}.jsonl"))
    }

    pub fn autorun_stats_file(&self) -> PathBuf {
        self.config_dir.join("autorun-stats.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    pub fn cli_activity_file(&self) -> PathBuf {
        self.config_dir.join("cli-activity.json")
    }

    pub fn auth_token_file(&self) -> PathBuf {
        self.config_dir.join("remote-token")
    }

    /// Ensure every directory the engine writes into exists.
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .context_path("create config directory", &self.config_dir)?;
        tokio::fs::create_dir_all(self.playbooks_dir())
            .await
            .context_path("create playbooks directory", &self.playbooks_dir())?;
        tokio::fs::create_dir_all(self.history_dir())
            .await
            .context_path("create history directory", &self.history_dir())?;
        Ok(())
    }

    pub fn remote_port(&self) -> Option<u16> {
        std::env::var(REMOTE_PORT_ENV).ok().and_then(|v| v.parse().ok())
    }
}

/// Stable, filesystem-safe hash of a workspace path used to name its
/// history file, so renames/moves of the config directory don't collide.
fn workspace_hash(path: &Path) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    path.to_string_lossy().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Opaque user-preference store. The core never interprets values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings(HashMap<String, Value>);

impl Settings {
    pub async fn load(config: &MaestroConfig) -> Self {
        match tokio::fs::read_to_string(config.settings_file()).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Settings::default(),
        }
    }

    pub async fn save(&self, config: &MaestroConfig) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(config.settings_file(), contents)
            .await
            .context_path("write settings.json", &config.settings_file())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_dir_env_override_is_honored() {
        std::env::set_var(CONFIG_DIR_ENV, "/tmp/maestro-test-config");
        let config = MaestroConfig::resolve().unwrap();
        assert_eq!(config.config_dir, PathBuf::from("/tmp/maestro-test-config"));
        std::env::remove_var(CONFIG_DIR_ENV);
    }

    #[test]
    fn workspace_hash_is_stable_and_distinct() {
        let a = workspace_hash(Path::new("/home/user/project-a"));
        let b = workspace_hash(Path::new("/home/user/project-a"));
        let c = workspace_hash(Path::new("/home/user/project-b"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn settings_get_set_roundtrip() {
        let mut settings = Settings::default();
        settings.set("theme", Value::String("dark".into()));
        assert_eq!(settings.get("theme"), Some(&Value::String("dark".into())));
        assert_eq!(settings.get("missing"), None);
    }
}
