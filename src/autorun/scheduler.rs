//! Auto Run batch scheduler: the state machine that drives a
//! playbook to completion. Grounded on the supervisor's own reactive,
//! event-driven dispatch/await pattern — the scheduler never polls for
//! prompt completion, it waits on the event bus and reacts to the next
//! state change instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::{Event, EventBus};
use crate::config::MaestroConfig;
use crate::error::{MaestroError, Result};
use crate::history::{AutoRunStats, HistoryEntry, HistoryKind, HistoryStore};
use crate::ids::SessionId;
use crate::session::tab::TabState;
use crate::session::SessionRegistry;
use crate::supervisor::Supervisor;

use super::playbook::{self, Playbook};
use super::template::TemplateContext;
use super::worktree;

/// Per-document task progress within a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentProgress {
    pub total: usize,
    pub completed: usize,
}

/// The observable state of a running Auto Run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRunState {
    pub running: bool,
    pub stopping: bool,
    pub documents: Vec<PathBuf>,
    pub current_document_index: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub per_document: Vec<DocumentProgress>,
    pub loop_enabled: bool,
    pub current_loop_iteration: u32,
    pub max_loops: Option<u32>,
    pub worktree_branch: Option<String>,
    pub accumulated_elapsed_ms: u64,
    pub last_active_timestamp: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
}

impl BatchRunState {
    /// Accumulate the delta since `last_active_timestamp` and clear it.
    pub fn on_suspend(&mut self) {
        if let Some(last) = self.last_active_timestamp.take() {
            let delta = Utc::now().signed_duration_since(last).num_milliseconds().max(0);
            self.accumulated_elapsed_ms += delta as u64;
        }
    }

    /// Restamp the active timestamp on wake.
    pub fn on_wake(&mut self) {
        self.last_active_timestamp = Some(Utc::now());
    }

    fn total_elapsed_ms(&self) -> u64 {
        let mut total = self.accumulated_elapsed_ms;
        if let Some(last) = self.last_active_timestamp {
            total += Utc::now().signed_duration_since(last).num_milliseconds().max(0) as u64;
        }
        total
    }
}

/// Flags accepted by the headless CLI entry.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub no_history: bool,
    pub wait: bool,
}

struct PlannedTask {
    document_index: usize,
    line_index: usize,
    text: String,
}

/// Drives one playbook to completion against one session.
pub struct Scheduler {
    registry: Arc<SessionRegistry>,
    supervisor: Arc<Supervisor>,
    bus: EventBus,
    config: MaestroConfig,
    history: HistoryStore,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        supervisor: Arc<Supervisor>,
        bus: EventBus,
        config: MaestroConfig,
    ) -> Self {
        let history = HistoryStore::new(config.clone());
        Self {
            registry,
            supervisor,
            bus,
            config,
            history,
        }
    }

    /// Request the batch for `session_id` to stop: lets the in-flight prompt finish naturally, then ends.
    pub async fn request_stop(&self, session_id: &SessionId) -> Result<()> {
        self.registry
            .mutate(session_id, |s| {
                if let Some(state) = s.batch_state.as_mut() {
                    state.stopping = true;
                }
                Ok(())
            })
            .await?;
        self.bus.publish(Event::AutorunStateChange {
            session_id: session_id.clone(),
        });
        Ok(())
    }

    /// Run `playbook` against `session_id`. Preconditions: the session is
    /// idle — no busy tab, empty execution queue.
    pub async fn run(
        &self,
        session_id: SessionId,
        playbook: Playbook,
        autorun_folder: PathBuf,
        options: RunOptions,
    ) -> Result<()> {
        let session = self
            .registry
            .get(&session_id)
            .await
            .ok_or_else(|| MaestroError::SessionNotFound(session_id.to_string()))?;
        if session.busy_tab_count() > 0 || !session.execution_queue.is_empty() {
            return Err(MaestroError::SessionBusy(session_id.to_string()));
        }

        // --- Preparing ---------------------------------------------------
        let mut per_document = Vec::with_capacity(playbook.documents.len());
        let mut plans: Vec<Vec<PlannedTask>> = Vec::with_capacity(playbook.documents.len());
        for (doc_index, doc) in playbook.documents.iter().enumerate() {
            let path = autorun_folder.join(doc);
            let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
                MaestroError::PlaybookInvalid {
                    document: doc.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            let tasks = playbook::parse_tasks(&contents);
            per_document.push(DocumentProgress {
                total: tasks.len(),
                completed: 0,
            });
            plans.push(
                tasks
                    .into_iter()
                    .map(|t| PlannedTask {
                        document_index: doc_index,
                        line_index: t.line_index,
                        text: t.text,
                    })
                    .collect(),
            );
        }
        let total_tasks: usize = per_document.iter().map(|d| d.total).sum();

        if options.dry_run {
            tracing::info!(session = %session_id, total_tasks, "dry run: plan built, no dispatch");
            return Ok(());
        }

        // Liveness record for cross-instance `--wait` polling — written here
        // rather than by callers, so a Desktop-triggered run (via the
        // gateway) advertises busyness to a concurrent CLI invocation just
        // as reliably as a CLI-triggered one.
        if let Err(e) = write_activity_record(&self.config, &session_id, &playbook.display_name).await {
            tracing::warn!(session = %session_id, error = %e, "failed to write cli-activity liveness record");
        }

        let worktree_branch = if let Some(settings) = &playbook.worktree {
            worktree::prepare(&self.registry, &session_id, settings).await?
        } else {
            None
        };

        let now = Utc::now();
        let mut state = BatchRunState {
            running: true,
            stopping: false,
            documents: playbook.documents.clone(),
            current_document_index: 0,
            total_tasks,
            completed_tasks: 0,
            per_document,
            loop_enabled: playbook.loop_enabled,
            current_loop_iteration: 0,
            max_loops: playbook.max_loops,
            worktree_branch,
            accumulated_elapsed_ms: 0,
            last_active_timestamp: Some(now),
            start_time: now,
        };
        self.publish_state(&session_id, state.clone()).await?;

        // --- Dispatching / AwaitingAgent / MarkDone loop ------------------
        let mut iteration: u32 = 0;
        let agent_kind = session.agent_kind.clone();
        'outer: loop {
            for doc_index in 0..playbook.documents.len() {
                // Loop replays re-parse the document fresh: an agent's own
                // edits may have re-opened or closed tasks.
                let tasks_this_pass = if iteration == 0 {
                    plans[doc_index]
                        .iter()
                        .map(|t| (t.line_index, t.text.clone()))
                        .collect::<Vec<_>>()
                } else {
                    let path = autorun_folder.join(&playbook.documents[doc_index]);
                    let contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();
                    playbook::parse_tasks(&contents)
                        .into_iter()
                        .map(|t| (t.line_index, t.text))
                        .collect::<Vec<_>>()
                };

                let new_total = tasks_this_pass.len();
                state.total_tasks -= state.per_document[doc_index].total;
                state.total_tasks += new_total;
                state.current_document_index = doc_index;
                state.per_document[doc_index].completed = 0;
                state.per_document[doc_index].total = new_total;
                self.publish_state(&session_id, state.clone()).await?;

                for (line_index, text) in tasks_this_pass {
                    if self.is_stopping(&session_id).await {
                        break 'outer;
                    }

                    let current = self.registry.get(&session_id).await;
                    let upstream_id = current
                        .as_ref()
                        .and_then(|s| s.active_tab_id.as_ref().and_then(|id| s.find_tab(id)))
                        .and_then(|t| t.upstream_agent_session_id.clone())
                        .unwrap_or_default();
                    let ctx = TemplateContext {
                        agent_name: agent_kind.label().to_string(),
                        agent_path: autorun_folder.display().to_string(),
                        agent_session_id: upstream_id,
                        agent_group: agent_kind.label().to_string(),
                        loop_number: iteration,
                        document_name: playbook.documents[doc_index]
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                    };
                    let expanded = playbook
                        .override_prompt
                        .as_deref()
                        .map(|p| ctx.expand(p))
                        .unwrap_or_else(|| ctx.expand(&text));

                    let doc_path = autorun_folder.join(&playbook.documents[doc_index]);
                    let outcome = self
                        .dispatch_and_await(&session_id, &expanded)
                        .await;

                    match outcome {
                        TaskOutcome::Completed => {
                            playbook::mark_task_done(&doc_path, line_index, &text).await?;
                            state.completed_tasks += 1;
                            state.per_document[doc_index].completed += 1;
                            self.publish_state(&session_id, state.clone()).await?;
                        }
                        TaskOutcome::RecoverableError => {
                            // Retry exactly once.
                            let retry = self.dispatch_and_await(&session_id, &expanded).await;
                            match retry {
                                TaskOutcome::Completed => {
                                    playbook::mark_task_done(&doc_path, line_index, &text).await?;
                                    state.completed_tasks += 1;
                                    state.per_document[doc_index].completed += 1;
                                    self.publish_state(&session_id, state.clone()).await?;
                                }
                                _ => {
                                    tracing::warn!(session = %session_id, task = %text, "task failed after one retry; ending batch in Error state");
                                    state.running = false;
                                    self.publish_state(&session_id, state.clone()).await?;
                                    return Err(MaestroError::AgentError {
                                        kind: crate::error::AgentErrorKind::Reported,
                                        message: format!("task failed twice: {text}"),
                                        recoverable: false,
                                    });
                                }
                            }
                        }
                        TaskOutcome::NonRecoverableError => {
                            state.running = false;
                            self.publish_state(&session_id, state.clone()).await?;
                            return Err(MaestroError::AgentError {
                                kind: crate::error::AgentErrorKind::Reported,
                                message: format!("non-recoverable agent error on task: {text}"),
                                recoverable: false,
                            });
                        }
                        TaskOutcome::Interrupted => {
                            break 'outer;
                        }
                    }

                    if self.is_stopping(&session_id).await {
                        break 'outer;
                    }
                }
            }

            let more_loops = state.loop_enabled
                && state
                    .max_loops
                    .map(|max| (iteration + 1) < max)
                    .unwrap_or(true);
            if !more_loops {
                break;
            }
            iteration += 1;
            state.current_loop_iteration = iteration;
            self.publish_state(&session_id, state.clone()).await?;
        }

        // --- Finalizing / Ended -------------------------------------------
        state.running = false;
        state.stopping = false;
        let elapsed_ms = state.total_elapsed_ms();
        self.publish_state(&session_id, state.clone()).await?;

        self.registry
            .mutate(&session_id, |s| {
                s.batch_state = None;
                Ok(())
            })
            .await?;
        self.bus.publish(Event::AutorunStateChange {
            session_id: session_id.clone(),
        });

        if !options.no_history {
            let summary = format!(
                "Auto Run completed: {}/{} tasks across {} document(s)",
                state.completed_tasks,
                state.total_tasks,
                state.documents.len()
            );
            let entry = HistoryEntry::new(HistoryKind::Auto, summary, session.working_directory.clone(), session_id.clone());
            let _ = self.history.append(&entry).await;
            self.bus.publish(Event::HistoryWritten {
                session_id: session_id.clone(),
            });

            let mut stats = self.history.load_stats().await;
            let unlocked = stats.record_run(elapsed_ms);
            let _ = self.history.save_stats(&stats).await;
            if let Some(badge) = unlocked {
                tracing::info!(badge = ?badge, "new Auto Run badge unlocked");
            }
        }

        Ok(())
    }

    async fn is_stopping(&self, session_id: &SessionId) -> bool {
        self.registry
            .get(session_id)
            .await
            .and_then(|s| s.batch_state.map(|b| b.stopping))
            .unwrap_or(false)
    }

    async fn publish_state(&self, session_id: &SessionId, state: BatchRunState) -> Result<()> {
        self.registry
            .mutate(session_id, move |s| {
                s.batch_state = Some(state);
                Ok(())
            })
            .await?;
        self.bus.publish(Event::AutorunStateChange {
            session_id: session_id.clone(),
        });
        Ok(())
    }

    /// Dispatch one prompt to the session's active tab and wait
    /// reactively (bus subscription, not polling) for it to settle.
    async fn dispatch_and_await(&self, session_id: &SessionId, prompt: &str) -> TaskOutcome {
        let mut receiver = self.bus.subscribe();

        loop {
            let Some(session) = self.registry.get(session_id).await else {
                return TaskOutcome::NonRecoverableError;
            };
            let Some(tab_id) = session.active_tab_id.clone() else {
                return TaskOutcome::NonRecoverableError;
            };

            match self.supervisor.dispatch(session_id, &tab_id, prompt, vec![]).await {
                Ok(()) => {
                    return self.await_completion(session_id, &tab_id, &mut receiver).await;
                }
                Err(MaestroError::WriteLocked { .. }) | Err(MaestroError::TabBusy { .. }) => {
                    // Wait for the next idle event rather than polling.
                    let _ = receiver.recv().await;
                    continue;
                }
                Err(_) => return TaskOutcome::NonRecoverableError,
            }
        }
    }

    async fn await_completion(
        &self,
        session_id: &SessionId,
        tab_id: &crate::ids::TabId,
        receiver: &mut tokio::sync::broadcast::Receiver<crate::bus::Envelope>,
    ) -> TaskOutcome {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    let relevant = matches!(
                        &envelope.event,
                        Event::TabStateChanged { session_id: sid, tab_id: tid }
                            if sid == session_id && tid == tab_id
                    );
                    if !relevant {
                        continue;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return TaskOutcome::NonRecoverableError;
                }
            }

            let Some(session) = self.registry.get(session_id).await else {
                return TaskOutcome::NonRecoverableError;
            };
            let Some(tab) = session.find_tab(tab_id) else {
                return TaskOutcome::NonRecoverableError;
            };
            if tab.state == TabState::Busy {
                continue;
            }
            return match &tab.last_error {
                None => TaskOutcome::Completed,
                Some(err) if err.kind == crate::error::AgentErrorKind::Interrupted => TaskOutcome::Interrupted,
                Some(err) if err.recoverable => TaskOutcome::RecoverableError,
                Some(_) => TaskOutcome::NonRecoverableError,
            };
        }
    }
}

enum TaskOutcome {
    Completed,
    RecoverableError,
    NonRecoverableError,
    Interrupted,
}

/// Write the `cli-activity` liveness record for `--wait`: a small JSON file per session advertising that a playbook is
/// running, keyed by session id.
pub async fn write_activity_record(config: &MaestroConfig, session_id: &SessionId, playbook_name: &str) -> Result<()> {
    let dir = config.config_dir.join("activity");
    tokio::fs::create_dir_all(&dir).await.ok();
    let path = dir.join(format!("{}.json", session_id.as_str()));
    let record = serde_json::json!({
        "sessionId": session_id.as_str(),
        "playbookName": playbook_name,
        "pid": std::process::id(),
        "startedAt": Utc::now(),
    });
    tokio::fs::write(&path, serde_json::to_vec_pretty(&record).unwrap())
        .await
        .map_err(|e| MaestroError::PersistenceFailure {
            what: "write cli-activity record".to_string(),
            cause: e.to_string(),
        })
}

/// Staleness window for a liveness record: older than this with
/// a dead PID is treated as stale.
pub const ACTIVITY_STALE_AFTER: Duration = Duration::from_secs(30);

/// Check whether `session_id` currently has a live (non-stale) activity
/// record, for the CLI's `--wait` poll loop.
pub async fn is_session_busy(config: &MaestroConfig, session_id: &SessionId) -> bool {
    let path = config.config_dir.join("activity").join(format!("{}.json", session_id.as_str()));
    let Ok(contents) = tokio::fs::read_to_string(&path).await else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&contents) else {
        return false;
    };
    let Some(started_at) = value.get("startedAt").and_then(|v| v.as_str()) else {
        return false;
    };
    let Ok(started_at) = DateTime::parse_from_rfc3339(started_at) else {
        return false;
    };
    let age = Utc::now().signed_duration_since(started_at.with_timezone(&Utc));
    if age.to_std().map(|d| d > ACTIVITY_STALE_AFTER).unwrap_or(true) {
        let pid = value.get("pid").and_then(|v| v.as_u64()).unwrap_or(0);
        return process_is_alive(pid as u32);
    }
    true
}

fn process_is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        shell_kill_probe(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(unix)]
fn shell_kill_probe(pid: u32) -> bool {
    // Signal 0 performs no-op existence checking (standard POSIX idiom).
    // Avoid a direct libc dependency: shell out to `kill -0`, matching the
    // CLI-adjacent tooling's existing preference for real OS primitives
    // over hand-rolled syscall bindings.
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_run_state_accumulates_suspended_time() {
        let mut state = BatchRunState {
            running: true,
            stopping: false,
            documents: vec![],
            current_document_index: 0,
            total_tasks: 1,
            completed_tasks: 0,
            per_document: vec![],
            loop_enabled: false,
            current_loop_iteration: 0,
            max_loops: None,
            worktree_branch: None,
            accumulated_elapsed_ms: 0,
            last_active_timestamp: Some(Utc::now() - chrono::Duration::milliseconds(500)),
            start_time: Utc::now(),
        };
        state.on_suspend();
        assert!(state.accumulated_elapsed_ms >= 500);
        assert!(state.last_active_timestamp.is_none());
        state.on_wake();
        assert!(state.last_active_timestamp.is_some());
    }
}
