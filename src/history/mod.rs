//! History and Auto Run stats. History writes are
//! side-effects of the scheduler and slash-commands; a failed write must
//! never fail the underlying action, so every write here is best-effort
//! from the caller's point of view (`Result` is returned for logging, not
//! for propagation).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MaestroConfig;
use crate::error::{MaestroError, Result, ResultExt};
use crate::ids::{HistoryEntryId, SessionId};
use crate::supervisor::parser::UsageStats;

/// Whether a history entry came from an unattended Auto Run or direct
/// user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Auto,
    User,
}

/// A synopsized record of past work, scoped to (workspace, session-id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: HistoryEntryId,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub full_response: Option<String>,
    pub upstream_agent_session_id: Option<String>,
    pub usage: Option<UsageStats>,
    pub workspace_path: std::path::PathBuf,
    pub session_id: SessionId,
}

impl HistoryEntry {
    pub fn new(kind: HistoryKind, summary: String, workspace_path: std::path::PathBuf, session_id: SessionId) -> Self {
        Self {
            id: HistoryEntryId::new(),
            kind,
            timestamp: Utc::now(),
            summary,
            full_response: None,
            upstream_agent_session_id: None,
            usage: None,
            workspace_path,
            session_id,
        }
    }
}

/// A small fixed ladder of Auto Run badges, keyed off
/// cumulative runtime minutes rather than an open-ended string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeLevel {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl BadgeLevel {
    /// Cumulative runtime (minutes) required to unlock each level.
    const LADDER: [(BadgeLevel, u64); 5] = [
        (BadgeLevel::Bronze, 60),
        (BadgeLevel::Silver, 5 * 60),
        (BadgeLevel::Gold, 24 * 60),
        (BadgeLevel::Platinum, 7 * 24 * 60),
        (BadgeLevel::Diamond, 30 * 24 * 60),
    ];

    /// The highest badge earned at `cumulative_minutes` of runtime, if any.
    pub fn for_cumulative_minutes(cumulative_minutes: u64) -> Option<BadgeLevel> {
        Self::LADDER
            .iter()
            .rev()
            .find(|(_, threshold)| cumulative_minutes >= *threshold)
            .map(|(level, _)| *level)
    }
}

/// A record of a badge unlock, with the timestamp it happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeHistoryEntry {
    pub level: BadgeLevel,
    pub unlocked_at: DateTime<Utc>,
}

/// Per-installation Auto Run counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoRunStats {
    pub cumulative_runtime_ms: u64,
    pub longest_single_run_ms: u64,
    pub longest_run_timestamp: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub current_badge_level: Option<BadgeLevel>,
    pub last_unlocked_badge_level: Option<BadgeLevel>,
    pub last_acknowledged_badge_level: Option<BadgeLevel>,
    pub badge_history: Vec<BadgeHistoryEntry>,
}

impl AutoRunStats {
    /// Record the completion of one Auto Run and return the newly
    /// unlocked badge, if `cumulative_runtime_ms` just crossed a rung on
    /// the ladder it hadn't already reached.
    pub fn record_run(&mut self, run_elapsed_ms: u64) -> Option<BadgeLevel> {
        self.cumulative_runtime_ms += run_elapsed_ms;
        self.total_runs += 1;
        if run_elapsed_ms > self.longest_single_run_ms {
            self.longest_single_run_ms = run_elapsed_ms;
            self.longest_run_timestamp = Some(Utc::now());
        }

        let cumulative_minutes = self.cumulative_runtime_ms / 60_000;
        let newly_earned = BadgeLevel::for_cumulative_minutes(cumulative_minutes);
        self.current_badge_level = newly_earned;

        match newly_earned {
            Some(level) if self.last_unlocked_badge_level.map(|l| l < level).unwrap_or(true) => {
                self.last_unlocked_badge_level = Some(level);
                self.badge_history.push(BadgeHistoryEntry {
                    level,
                    unlocked_at: Utc::now(),
                });
                Some(level)
            }
            _ => None,
        }
    }

    pub fn acknowledge(&mut self, level: BadgeLevel) {
        self.last_acknowledged_badge_level = Some(level);
    }
}

/// File-backed history and stats persistence.
pub struct HistoryStore {
    config: MaestroConfig,
}

impl HistoryStore {
    pub fn new(config: MaestroConfig) -> Self {
        Self { config }
    }

    /// Append one entry to the workspace's history file. Best-effort: the
    /// caller logs and continues on failure rather than failing the
    /// underlying action.
    pub async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let path = self.config.history_file(&entry.workspace_path);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let mut line = serde_json::to_string(entry).map_err(|e| MaestroError::PersistenceFailure {
            what: "serialize history entry".to_string(),
            cause: e.to_string(),
        })?;
        line.push('\n');

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context_path("open history file", &path)
            .map_err(|e| MaestroError::PersistenceFailure {
                what: "open history file".to_string(),
                cause: e.to_string(),
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| MaestroError::PersistenceFailure {
                what: "append history entry".to_string(),
                cause: e.to_string(),
            })
    }

    /// Read every entry for `workspace_path`, in append order.
    pub async fn list(&self, workspace_path: &Path) -> Vec<HistoryEntry> {
        let path = self.config.history_file(workspace_path);
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub async fn load_stats(&self) -> AutoRunStats {
        let path = self.config.autorun_stats_file();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => AutoRunStats::default(),
        }
    }

    pub async fn save_stats(&self, stats: &AutoRunStats) -> Result<()> {
        let path = self.config.autorun_stats_file();
        let contents = serde_json::to_string_pretty(stats).map_err(|e| MaestroError::PersistenceFailure {
            what: "serialize autorun-stats.json".to_string(),
            cause: e.to_string(),
        })?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| MaestroError::PersistenceFailure {
                what: "write autorun-stats.json".to_string(),
                cause: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> (MaestroConfig, TempDir) {
        let dir = TempDir::new().unwrap();
        (
            MaestroConfig {
                config_dir: dir.path().to_path_buf(),
                output_coalesce_window_ms: 5_000,
            },
            dir,
        )
    }

    #[test]
    fn badge_ladder_picks_highest_crossed_rung() {
        assert_eq!(BadgeLevel::for_cumulative_minutes(0), None);
        assert_eq!(BadgeLevel::for_cumulative_minutes(61), Some(BadgeLevel::Bronze));
        assert_eq!(BadgeLevel::for_cumulative_minutes(5 * 60 + 1), Some(BadgeLevel::Silver));
    }

    #[test]
    fn record_run_unlocks_a_badge_exactly_once() {
        let mut stats = AutoRunStats::default();
        let first = stats.record_run(61 * 60_000);
        assert_eq!(first, Some(BadgeLevel::Bronze));
        let second = stats.record_run(1_000);
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn history_entries_round_trip_in_append_order() {
        let (config, _dir) = test_config();
        let store = HistoryStore::new(config);
        let workspace = std::path::PathBuf::from("/tmp/my-workspace");
        let session_id = SessionId::new();

        let e1 = HistoryEntry::new(HistoryKind::Auto, "first".into(), workspace.clone(), session_id.clone());
        let e2 = HistoryEntry::new(HistoryKind::User, "second".into(), workspace.clone(), session_id.clone());
        store.append(&e1).await.unwrap();
        store.append(&e2).await.unwrap();

        let entries = store.list(&workspace).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].summary, "first");
        assert_eq!(entries[1].summary, "second");
    }

    #[tokio::test]
    async fn stats_round_trip_through_disk() {
        let (config, _dir) = test_config();
        let store = HistoryStore::new(config);
        let mut stats = store.load_stats().await;
        stats.record_run(120_000);
        store.save_stats(&stats).await.unwrap();

        let reloaded = store.load_stats().await;
        assert_eq!(reloaded.total_runs, 1);
        assert_eq!(reloaded.cumulative_runtime_ms, 120_000);
    }
}
