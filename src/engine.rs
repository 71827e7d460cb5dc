//! Engine assembly: wires the session registry, adapter
//! registry, supervisor, scheduler, and event bus into one owned graph,
//! and runs the one background task that drains a session's execution
//! queue once its active tab idles again — a
//! responsibility the supervisor's reader task explicitly leaves to its
//! caller since it only holds `&EventBus`/`&SessionRegistry`.

use std::path::PathBuf;
use std::sync::Arc;

use crate::adapter::{AdapterRegistry, AgentKind};
use crate::autorun::{PlaybookStore, Scheduler};
use crate::bus::{Event, EventBus};
use crate::config::MaestroConfig;
use crate::error::Result;
use crate::gateway::GatewayState;
use crate::history::HistoryStore;
use crate::ids::SessionId;
use crate::session::{Session, SessionRegistry};
use crate::supervisor::Supervisor;

/// The fully assembled set of long-lived subsystems a running installation
/// needs, whether driven by the CLI's `run` verb or the (future) GUI shell.
pub struct Engine {
    pub config: MaestroConfig,
    pub registry: Arc<SessionRegistry>,
    pub adapters: AdapterRegistry,
    pub supervisor: Arc<Supervisor>,
    pub scheduler: Arc<Scheduler>,
    pub playbooks: Arc<PlaybookStore>,
    pub history: Arc<HistoryStore>,
    pub bus: EventBus,
}

impl Engine {
    /// Assemble every subsystem, reconcile persisted sessions, and start the execution-queue drain task.
    pub async fn bootstrap(config: MaestroConfig) -> anyhow::Result<Self> {
        config.ensure_dirs().await?;

        let registry = Arc::new(SessionRegistry::new(config.clone()));
        registry
            .reconcile()
            .await
            .map_err(|e| anyhow::anyhow!("reconcile sessions: {e}"))?;

        let adapters = AdapterRegistry::with_builtin_adapters();
        let bus = EventBus::new();
        let supervisor = Arc::new(Supervisor::new(registry.clone(), adapters.clone(), bus.clone()));
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            supervisor.clone(),
            bus.clone(),
            config.clone(),
        ));
        let playbooks = Arc::new(PlaybookStore::new(config.clone()));
        let history = Arc::new(HistoryStore::new(config.clone()));

        let engine = Self {
            config,
            registry,
            adapters,
            supervisor,
            scheduler,
            playbooks,
            history,
            bus,
        };
        engine.spawn_queue_drain_task();
        Ok(engine)
    }

    fn spawn_queue_drain_task(&self) {
        let mut receiver = self.bus.subscribe();
        let registry = self.registry.clone();
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if let Event::SessionStateChange { session_id } = envelope.event {
                            drain_execution_queue(&registry, &supervisor, &session_id).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn create_session(
        &self,
        workspace: PathBuf,
        agent_kind: AgentKind,
        display_name: String,
    ) -> Result<SessionId> {
        let id = self.registry.create(workspace, agent_kind, display_name).await?;
        self.bus.publish(Event::SessionAdded { session_id: id.clone() });
        Ok(id)
    }

    pub async fn remove_session(&self, id: &SessionId) -> Result<()> {
        self.registry.delete(id).await?;
        self.bus.publish(Event::SessionRemoved { session_id: id.clone() });
        Ok(())
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.registry.list().await
    }

    pub fn gateway_state(&self, token: String) -> GatewayState {
        GatewayState {
            registry: self.registry.clone(),
            supervisor: self.supervisor.clone(),
            scheduler: self.scheduler.clone(),
            playbooks: self.playbooks.clone(),
            bus: self.bus.clone(),
            token,
        }
    }
}

/// Dispatch the execution queue's head item for `session_id`, if its
/// target tab is now idle and uncontended. A no-op otherwise: the queue
/// stays put until the next `SessionStateChange`, and `Supervisor::dispatch`
/// re-checks the write lock itself, so a stale wakeup here is harmless.
async fn drain_execution_queue(registry: &Arc<SessionRegistry>, supervisor: &Arc<Supervisor>, session_id: &SessionId) {
    let Some(session) = registry.get(session_id).await else {
        return;
    };
    let Some(tab_id) = session.active_tab_id.clone() else {
        return;
    };
    let Some(item) = session.execution_queue.front() else {
        return;
    };
    if item.target_tab_id != tab_id || session.check_write_lock(&tab_id).is_err() {
        return;
    }

    let popped = registry
        .mutate(session_id, {
            let tab_id = tab_id.clone();
            move |s| {
                let head_targets_tab = s
                    .execution_queue
                    .front()
                    .map(|i| i.target_tab_id == tab_id)
                    .unwrap_or(false);
                Ok(head_targets_tab.then(|| s.execution_queue.pop_front()).flatten())
            }
        })
        .await
        .ok()
        .flatten();

    if let Some(item) = popped {
        if let Err(e) = supervisor.dispatch(session_id, &tab_id, &item.text, item.images).await {
            tracing::warn!(
                session = %session_id,
                tab = %tab_id,
                error = %e,
                "queued prompt dropped: dispatch failed after being popped from the execution queue"
            );
        }
    }
}
