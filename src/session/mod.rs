//! Session registry: CRUD over sessions, persistence, and startup
//! reconciliation. A DashMap-style create/get/list/remove surface over
//! PTY-driven agent processes, plus the write-mode lock, tab model, and
//! execution queue layered on top.

pub mod tab;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::adapter::AgentKind;
use crate::autorun::BatchRunState;
use crate::config::MaestroConfig;
use crate::error::{MaestroError, Result, ResultExt};
use crate::ids::{PlaybookId, SessionId, TabId};
use tab::{ClosedTabRing, ExecutionQueueItem, ScrollPositions, Tab, TabState};

/// Whether a session's active input targets the agent conversation or a
/// raw shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    Interactive,
    Shell,
}

/// Coarse VCS state detected for a session's working directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VcsState {
    pub is_repo: bool,
    pub branch: Option<String>,
    pub dirty: bool,
}

/// Detect the VCS state of `path` via `git2`, the same crate the
/// worktree-mode scheduler uses for branch creation.
pub fn detect_vcs_state(path: &Path) -> VcsState {
    let Ok(repo) = git2::Repository::discover(path) else {
        return VcsState::default();
    };
    let branch = repo
        .head()
        .ok()
        .and_then(|head| head.shorthand().map(String::from));
    let dirty = repo
        .statuses(None)
        .map(|statuses| !statuses.is_empty())
        .unwrap_or(false);
    VcsState {
        is_repo: true,
        branch,
        dirty,
    }
}

/// A session's selected Auto Run playbook and folder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoRunConfig {
    pub folder: Option<PathBuf>,
    pub selected_playbook_id: Option<PlaybookId>,
}

/// The top-level unit: one workspace bound to one agent kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub display_name: String,
    pub working_directory: PathBuf,
    pub vcs_state: VcsState,
    pub agent_kind: AgentKind,
    pub input_mode: InputMode,
    pub tabs: Vec<Tab>,
    pub active_tab_id: Option<TabId>,
    pub execution_queue: VecDeque<ExecutionQueueItem>,
    pub autorun: AutoRunConfig,
    #[serde(skip)]
    pub batch_state: Option<BatchRunState>,
    pub closed_tabs: ClosedTabRing,
    pub scroll_positions: ScrollPositions,
    pub created_at: DateTime<Utc>,
    /// Set while an agent child process is running; cleared on exit and
    /// never persisted (reconcile clears transient fields on load).
    #[serde(skip)]
    pub has_live_process: bool,
}

impl Session {
    pub fn new(working_directory: PathBuf, agent_kind: AgentKind, display_name: String) -> Self {
        let id = SessionId::new();
        let tab = Tab::new(id.clone());
        let active_tab_id = Some(tab.id.clone());
        Self {
            id,
            display_name,
            vcs_state: detect_vcs_state(&working_directory),
            working_directory,
            agent_kind,
            input_mode: InputMode::Interactive,
            tabs: vec![tab],
            active_tab_id,
            execution_queue: VecDeque::new(),
            autorun: AutoRunConfig::default(),
            batch_state: None,
            closed_tabs: ClosedTabRing::default(),
            scroll_positions: ScrollPositions::default(),
            created_at: Utc::now(),
            has_live_process: false,
        }
    }

    pub fn find_tab(&self, tab_id: &TabId) -> Option<&Tab> {
        self.tabs.iter().find(|t| &t.id == tab_id)
    }

    pub fn find_tab_mut(&mut self, tab_id: &TabId) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| &t.id == tab_id)
    }

    /// At most one tab in `busy` state may be dispatched to.
    pub fn busy_tab_count(&self) -> usize {
        self.tabs.iter().filter(|t| t.state == TabState::Busy).count()
    }

    pub fn any_other_tab_busy(&self, tab_id: &TabId) -> bool {
        self.tabs
            .iter()
            .any(|t| &t.id != tab_id && t.state == TabState::Busy)
    }

    /// Check the write-mode lock contract for dispatching to
    /// `tab_id`. Returns the specific tagged error on contention.
    pub fn check_write_lock(&self, tab_id: &TabId) -> Result<()> {
        let tab = self
            .find_tab(tab_id)
            .ok_or_else(|| MaestroError::TabNotFound(tab_id.to_string()))?;
        if tab.state == TabState::Busy {
            return Err(MaestroError::TabBusy {
                tab_id: tab_id.to_string(),
            });
        }
        if self.any_other_tab_busy(tab_id) {
            return Err(MaestroError::WriteLocked {
                session_id: self.id.to_string(),
            });
        }
        Ok(())
    }

    /// *Create tab*: append and activate.
    pub fn create_tab(&mut self, upstream_agent_session_id: Option<String>, name: Option<String>, starred: bool) -> TabId {
        let mut tab = Tab::new(self.id.clone());
        tab.upstream_agent_session_id = upstream_agent_session_id;
        tab.name = name;
        tab.starred = starred;
        let id = tab.id.clone();
        self.tabs.push(tab);
        self.active_tab_id = Some(id.clone());
        id
    }

    /// *Close tab*. Refuses busy tabs; auto-creates a fresh
    /// empty tab if this was the last one remaining.
    pub fn close_tab(&mut self, tab_id: &TabId) -> Result<()> {
        let index = self
            .tabs
            .iter()
            .position(|t| &t.id == tab_id)
            .ok_or_else(|| MaestroError::TabNotFound(tab_id.to_string()))?;
        if self.tabs[index].state == TabState::Busy {
            return Err(MaestroError::TabBusy {
                tab_id: tab_id.to_string(),
            });
        }

        let closed = self.tabs.remove(index);
        let was_active = self.active_tab_id.as_ref() == Some(tab_id);
        self.closed_tabs.push(closed, index);

        if self.tabs.is_empty() {
            let fresh = self.create_tab(None, None, false);
            self.active_tab_id = Some(fresh);
            return Ok(());
        }

        if was_active {
            // neighbouring tab: next, falling back to previous.
            let next_index = index.min(self.tabs.len() - 1);
            self.active_tab_id = Some(self.tabs[next_index].id.clone());
        }
        Ok(())
    }

    /// *Reopen closed tab*: duplicate-guarded against live
    /// tabs sharing the same upstream agent-session-id.
    pub fn reopen_closed_tab(&mut self) -> Option<TabId> {
        let closed = self.closed_tabs.pop_most_recent()?;

        if let Some(upstream) = &closed.tab.upstream_agent_session_id {
            if let Some(existing) = self
                .tabs
                .iter()
                .find(|t| t.upstream_agent_session_id.as_deref() == Some(upstream.as_str()))
            {
                let id = existing.id.clone();
                self.active_tab_id = Some(id.clone());
                return Some(id);
            }
        }

        let id = closed.tab.id.clone();
        let insert_at = closed.original_index.min(self.tabs.len());
        self.tabs.insert(insert_at, closed.tab);
        self.active_tab_id = Some(id.clone());
        Some(id)
    }

    pub fn navigate_next(&mut self) {
        self.navigate_by(1);
    }

    pub fn navigate_previous(&mut self) {
        self.navigate_by(-1);
    }

    fn navigate_by(&mut self, delta: isize) {
        if self.tabs.is_empty() {
            return;
        }
        let current = self
            .active_tab_id
            .as_ref()
            .and_then(|id| self.tabs.iter().position(|t| &t.id == id))
            .unwrap_or(0);
        let len = self.tabs.len() as isize;
        let next = ((current as isize + delta).rem_euclid(len)) as usize;
        self.active_tab_id = Some(self.tabs[next].id.clone());
    }

    pub fn navigate_by_index(&mut self, index: usize) {
        if let Some(tab) = self.tabs.get(index) {
            self.active_tab_id = Some(tab.id.clone());
        }
    }

    pub fn navigate_last(&mut self) {
        if let Some(tab) = self.tabs.last() {
            self.active_tab_id = Some(tab.id.clone());
        }
    }
}

/// Serialized form of the sessions file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionsFile {
    sessions: Vec<Session>,
}

/// Owns the set of sessions and their persisted form. A single
/// `tokio::sync::RwLock` over the whole map stands in for a single
/// serialization authority: every mutation takes the write half, every
/// snapshot read takes the read half, so the engine-wide invariants only
/// ever need to be checked in one place.
pub struct SessionRegistry {
    config: MaestroConfig,
    sessions: RwLock<Vec<Session>>,
}

impl SessionRegistry {
    pub fn new(config: MaestroConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(Vec::new()),
        }
    }

    /// *Create session*.
    pub async fn create(
        &self,
        workspace_path: PathBuf,
        agent_kind: AgentKind,
        display_name: String,
    ) -> Result<SessionId> {
        if !workspace_path.is_dir() {
            return Err(MaestroError::InvalidPath(workspace_path.display().to_string()));
        }
        let session = Session::new(workspace_path, agent_kind, display_name);
        let id = session.id.clone();
        self.sessions.write().await.push(session);
        self.persist().await?;
        Ok(id)
    }

    /// *Delete session*: best-effort; a missing playbook file is not an
    /// error.
    pub async fn delete(&self, id: &SessionId) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|s| &s.id != id);
            if sessions.len() == before {
                return Err(MaestroError::SessionNotFound(id.to_string()));
            }
        }
        let playbook_path = self.config.playbook_file(id.as_str());
        let _ = tokio::fs::remove_file(playbook_path).await;
        self.persist().await
    }

    pub async fn update_working_directory(&self, id: &SessionId, new_cwd: PathBuf) -> Result<()> {
        if !new_cwd.is_dir() {
            return Err(MaestroError::InvalidPath(new_cwd.display().to_string()));
        }
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .iter_mut()
                .find(|s| &s.id == id)
                .ok_or_else(|| MaestroError::SessionNotFound(id.to_string()))?;
            session.vcs_state = detect_vcs_state(&new_cwd);
            session.working_directory = new_cwd;
        }
        self.persist().await
    }

    pub async fn rename(&self, id: &SessionId, display_name: String) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .iter_mut()
                .find(|s| &s.id == id)
                .ok_or_else(|| MaestroError::SessionNotFound(id.to_string()))?;
            session.display_name = display_name;
        }
        self.persist().await
    }

    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.read().await.iter().find(|s| &s.id == id).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.clone()
    }

    /// Apply `f` to the session under the registry's write lock and
    /// persist afterwards. This is the mutation seam every other
    /// subsystem (supervisor, scheduler, gateway) goes through.
    pub async fn mutate<F, T>(&self, id: &SessionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T>,
    {
        let result = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .iter_mut()
                .find(|s| &s.id == id)
                .ok_or_else(|| MaestroError::SessionNotFound(id.to_string()))?;
            f(session)?
        };
        self.persist().await?;
        Ok(result)
    }

    /// *Reconcile*: load persisted sessions; re-scan VCS
    /// state, clear transient fields, drop any `BatchRunState`. Tabs and
    /// logs are kept intact.
    pub async fn reconcile(&self) -> Result<()> {
        let path = self.config.sessions_file();
        let file: SessionsFile = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => SessionsFile::default(),
        };

        let mut sessions = file.sessions;
        for session in &mut sessions {
            session.vcs_state = detect_vcs_state(&session.working_directory);
            session.batch_state = None;
            session.has_live_process = false;
            for tab in &mut session.tabs {
                tab.state = TabState::Idle;
                tab.last_error = None;
            }
        }

        *self.sessions.write().await = sessions;
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let sessions = self.sessions.read().await.clone();
        let file = SessionsFile { sessions };
        let contents = serde_json::to_string_pretty(&file).map_err(|e| MaestroError::PersistenceFailure {
            what: "serialize sessions.json".to_string(),
            cause: e.to_string(),
        })?;
        tokio::fs::write(self.config.sessions_file(), contents)
            .await
            .context_path("write sessions.json", &self.config.sessions_file())
            .map_err(|e| MaestroError::PersistenceFailure {
                what: "write sessions.json".to_string(),
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

    #[tokio::test]
    async fn create_requires_existing_directory() {
        let (config, _dir) = test_config();
        let registry = SessionRegistry::new(config);
        let err = registry
            .create(PathBuf::from("/no/such/path"), AgentKind::ClaudeCode, "x".into())
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "InvalidPath");
    }

    #[tokio::test]
    async fn create_yields_single_empty_tab() {
        let (config, dir) = test_config();
        tokio::fs::create_dir_all(&config.config_dir).await.unwrap();
        let registry = SessionRegistry::new(config);
        let id = registry
            .create(dir.path().to_path_buf(), AgentKind::ClaudeCode, "demo".into())
            .await
            .unwrap();
        let session = registry.get(&id).await.unwrap();
        assert_eq!(session.tabs.len(), 1);
        assert!(session.tabs[0].upstream_agent_session_id.is_none());
    }

    #[tokio::test]
    async fn closing_last_tab_creates_fresh_active_tab() {
        let (config, dir) = test_config();
        tokio::fs::create_dir_all(&config.config_dir).await.unwrap();
        let registry = SessionRegistry::new(config);
        let id = registry
            .create(dir.path().to_path_buf(), AgentKind::ClaudeCode, "demo".into())
            .await
            .unwrap();
        let only_tab = registry.get(&id).await.unwrap().tabs[0].id.clone();
        registry
            .mutate(&id, |s| s.close_tab(&only_tab).map_err(Into::into))
            .await
            .unwrap();
        let session = registry.get(&id).await.unwrap();
        assert_eq!(session.tabs.len(), 1);
        assert_ne!(session.tabs[0].id, only_tab);
        assert_eq!(session.active_tab_id, Some(session.tabs[0].id.clone()));
    }

    #[tokio::test]
    async fn closing_busy_tab_is_refused() {
        let (config, dir) = test_config();
        tokio::fs::create_dir_all(&config.config_dir).await.unwrap();
        let registry = SessionRegistry::new(config);
        let id = registry
            .create(dir.path().to_path_buf(), AgentKind::ClaudeCode, "demo".into())
            .await
            .unwrap();
        let tab_id = registry.get(&id).await.unwrap().tabs[0].id.clone();
        registry
            .mutate(&id, |s| {
                s.find_tab_mut(&tab_id).unwrap().state = TabState::Busy;
                Ok(())
            })
            .await
            .unwrap();
        let err = registry
            .mutate(&id, |s| s.close_tab(&tab_id).map_err(Into::into))
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "TabBusy");
    }

    #[test]
    fn reopen_closed_tab_duplicate_guard() {
        let mut session = Session::new(PathBuf::from("/tmp"), AgentKind::ClaudeCode, "demo".into());
        let original_tab = session.tabs[0].id.clone();
        session.find_tab_mut(&original_tab).unwrap().upstream_agent_session_id =
            Some("upstream-1".to_string());

        let second = session.create_tab(Some("upstream-1".to_string()), None, false);
        assert_ne!(second, original_tab);

        session.close_tab(&second).unwrap();
        assert!(!session.closed_tabs.is_empty());

        let reactivated = session.reopen_closed_tab().unwrap();
        assert_eq!(reactivated, original_tab);
        assert_eq!(session.tabs.len(), 1);
    }

    #[test]
    fn write_lock_blocks_dispatch_to_idle_tab_when_another_is_busy() {
        let mut session = Session::new(PathBuf::from("/tmp"), AgentKind::ClaudeCode, "demo".into());
        let tab_a = session.tabs[0].id.clone();
        let tab_b = session.create_tab(None, None, false);

        session.find_tab_mut(&tab_a).unwrap().state = TabState::Busy;
        let err = session.check_write_lock(&tab_b).unwrap_err();
        assert_eq!(err.tag(), "WriteLocked");
    }

    #[test]
    fn navigate_next_wraps_at_the_end() {
        let mut session = Session::new(PathBuf::from("/tmp"), AgentKind::ClaudeCode, "demo".into());
        let first = session.tabs[0].id.clone();
        session.create_tab(None, None, false);
        session.active_tab_id = Some(session.tabs.last().unwrap().id.clone());
        session.navigate_next();
        assert_eq!(session.active_tab_id, Some(first));
    }
}
