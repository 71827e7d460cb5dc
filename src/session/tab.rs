//! Tab model: one conversation within a session, and the write-mode lock
//! contract.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::LogSource;
use crate::config::CLOSED_TAB_RING_CAPACITY;
use crate::error::AgentErrorKind;
use crate::ids::{ExecutionQueueItemId, LogEntryId, SessionId, TabId};
use crate::supervisor::parser::UsageStats;

/// A tab's coarse lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabState {
    Idle,
    Busy,
    Error,
}

/// The last error surfaced on a tab, kept until the next dispatch clears it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastErrorRecord {
    pub kind: AgentErrorKind,
    pub message: String,
    pub recoverable: bool,
    pub at: DateTime<Utc>,
}

/// An append-only record belonging to one tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogEntryId,
    pub at: DateTime<Utc>,
    pub source: LogSource,
    pub text: String,
    pub images: Vec<String>,
    pub structured_payload: Option<Value>,
}

impl LogEntry {
    pub fn new(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            id: LogEntryId::new(),
            at: Utc::now(),
            source,
            text: text.into(),
            images: Vec::new(),
            structured_payload: None,
        }
    }
}

/// A pending prompt bound to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionQueueItem {
    pub id: ExecutionQueueItemId,
    pub text: String,
    pub images: Vec<String>,
    pub target_tab_id: TabId,
    pub enqueued_at: DateTime<Utc>,
}

impl ExecutionQueueItem {
    pub fn new(text: impl Into<String>, images: Vec<String>, target_tab_id: TabId) -> Self {
        Self {
            id: ExecutionQueueItemId::new(),
            text: text.into(),
            images,
            target_tab_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// One conversation inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    /// Stored so a tab is serializable (and answerable over the remote
    /// gateway) without a pointer back to its parent session.
    pub session_id: SessionId,
    pub upstream_agent_session_id: Option<String>,
    pub name: Option<String>,
    pub starred: bool,
    pub log: Vec<LogEntry>,
    pub input_draft: String,
    pub staged_images: Vec<String>,
    pub usage: UsageStats,
    pub created_at: DateTime<Utc>,
    pub state: TabState,
    pub read_only: bool,
    pub save_to_history: bool,
    pub last_error: Option<LastErrorRecord>,
    /// Cleared on reconcile: a transient field not meaningful across a
    /// process restart, since no child agent is actually running yet.
    #[serde(skip)]
    pub busy_since: Option<DateTime<Utc>>,
}

impl Tab {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            id: TabId::new(),
            session_id,
            upstream_agent_session_id: None,
            name: None,
            starred: false,
            log: Vec::new(),
            input_draft: String::new(),
            staged_images: Vec::new(),
            usage: UsageStats::default(),
            created_at: Utc::now(),
            state: TabState::Idle,
            read_only: false,
            save_to_history: true,
            last_error: None,
            busy_since: None,
        }
    }

    /// Effective display name: the tab's name if non-empty,
    /// otherwise the first octet of its agent-session-id, otherwise the
    /// caller-supplied session display name.
    pub fn effective_name(&self, session_display_name: &str) -> String {
        if let Some(name) = &self.name {
            if !name.is_empty() {
                return name.clone();
            }
        }
        if let Some(upstream) = &self.upstream_agent_session_id {
            if let Some(octet) = upstream.split(['-', ':']).next() {
                if !octet.is_empty() {
                    return octet.to_string();
                }
            }
        }
        session_display_name.to_string()
    }

    /// Append stdout/stderr text, applying the streaming-coalescence rule:
    /// merge into the last entry if it is the same source and its last
    /// append was within the tunable window.
    pub fn append_output(&mut self, source: LogSource, text: &str, coalesce_window: std::time::Duration) {
        if matches!(source, LogSource::Stdout | LogSource::Stderr) {
            if let Some(last) = self.log.last_mut() {
                if last.source == source {
                    let age = Utc::now().signed_duration_since(last.at);
                    if age.to_std().map(|d| d < coalesce_window).unwrap_or(false) {
                        last.text.push_str(text);
                        last.at = Utc::now();
                        return;
                    }
                }
            }
        }
        self.log.push(LogEntry::new(source, text));
    }
}

/// A tombstone for a closed tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTab {
    pub tab: Tab,
    pub original_index: usize,
    pub closed_at: DateTime<Utc>,
}

/// Bounded ring of recently closed tabs, for "reopen last closed".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClosedTabRing(VecDeque<ClosedTab>);

impl ClosedTabRing {
    pub fn push(&mut self, tab: Tab, original_index: usize) {
        self.0.push_back(ClosedTab {
            tab,
            original_index,
            closed_at: Utc::now(),
        });
        while self.0.len() > CLOSED_TAB_RING_CAPACITY {
            self.0.pop_front();
        }
    }

    pub fn pop_most_recent(&mut self) -> Option<ClosedTab> {
        self.0.pop_back()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-tab UI scroll position, persisted with the session.
pub type ScrollPositions = HashMap<TabId, u64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_name_falls_back_to_agent_session_octet() {
        let mut tab = Tab::new(SessionId::from("s1"));
        tab.upstream_agent_session_id = Some("abcd1234-5678".to_string());
        assert_eq!(tab.effective_name("My Session"), "abcd1234");
    }

    #[test]
    fn effective_name_falls_back_to_session_name() {
        let tab = Tab::new(SessionId::from("s1"));
        assert_eq!(tab.effective_name("My Session"), "My Session");
    }

    #[test]
    fn empty_name_string_is_treated_as_unset() {
        let mut tab = Tab::new(SessionId::from("s1"));
        tab.name = Some(String::new());
        assert_eq!(tab.effective_name("My Session"), "My Session");
    }

    #[test]
    fn coalesces_rapid_stdout_appends() {
        let mut tab = Tab::new(SessionId::from("s1"));
        tab.append_output(LogSource::Stdout, "hello ", std::time::Duration::from_secs(5));
        tab.append_output(LogSource::Stdout, "world", std::time::Duration::from_secs(5));
        assert_eq!(tab.log.len(), 1);
        assert_eq!(tab.log[0].text, "hello world");
    }

    #[test]
    fn user_entries_never_coalesce_with_stdout() {
        let mut tab = Tab::new(SessionId::from("s1"));
        tab.append_output(LogSource::User, "do the thing", std::time::Duration::from_secs(5));
        tab.append_output(LogSource::Stdout, "ok", std::time::Duration::from_secs(5));
        assert_eq!(tab.log.len(), 2);
    }

    #[test]
    fn closed_tab_ring_is_bounded() {
        let mut ring = ClosedTabRing::default();
        for _ in 0..30 {
            ring.push(Tab::new(SessionId::from("s1")), 0);
        }
        assert_eq!(ring.0.len(), CLOSED_TAB_RING_CAPACITY);
    }
}
