//! Remote control gateway: a WebSocket hub for live clients
//! plus an HTTP side channel for one-shot operations. Authenticates with a
//! per-installation token minted at first startup.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::autorun::{PlaybookStore, RunOptions, Scheduler};
use crate::bus::{Envelope, Event, EventBus, LogSource};
use crate::config::{MaestroConfig, REMOTE_CLIENT_BACKPRESSURE_BYTES};
use crate::error::{MaestroError, Result};
use crate::ids::{SessionId, TabId};
use crate::session::{InputMode, SessionRegistry};
use crate::supervisor::Supervisor;

/// Approximate outbound channel depth corresponding to the documented 4 MB
/// backpressure threshold, assuming a conservative average frame size.
/// A client whose queue exceeds this is dropped rather than memoized
/// against; on reconnect it gets a fresh snapshot instead of a replay.
const CLIENT_QUEUE_DEPTH: usize = REMOTE_CLIENT_BACKPRESSURE_BYTES / 512;

/// Mint (or load) the per-installation remote-control token.
pub async fn load_or_create_token(config: &MaestroConfig) -> Result<String> {
    let path = config.auth_token_file();
    if let Ok(existing) = tokio::fs::read_to_string(&path).await {
        let token = existing.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }
    let token = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    tokio::fs::write(&path, &token)
        .await
        .map_err(|e| MaestroError::PersistenceFailure {
            what: "write remote-token".to_string(),
            cause: e.to_string(),
        })?;
    Ok(token)
}

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<SessionRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub scheduler: Arc<Scheduler>,
    pub playbooks: Arc<PlaybookStore>,
    pub bus: EventBus,
    pub token: String,
}

/// Client→server message types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SelectSession { session_id: SessionId },
    SelectTab { session_id: SessionId, tab_id: TabId },
    NewTab { session_id: SessionId },
    CloseTab { session_id: SessionId, tab_id: TabId },
    SendCommand {
        session_id: SessionId,
        command: String,
        input_mode: InputMode,
    },
    SwitchMode { session_id: SessionId, mode: InputMode },
}

/// Server→client event types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerEvent {
    SessionsUpdate {
        sessions: Vec<crate::session::Session>,
        theme: serde_json::Value,
        custom_commands: Vec<serde_json::Value>,
    },
    SessionAdded { session_id: SessionId },
    SessionRemoved { session_id: SessionId },
    SessionStateChange { session_id: SessionId },
    SessionOutput {
        session_id: SessionId,
        source: LogSource,
        text: String,
    },
    UserInput {
        session_id: SessionId,
        command: String,
        mode: InputMode,
    },
    ActiveSessionChanged { session_id: Option<SessionId> },
    ThemeUpdate,
    CustomCommands,
    AutorunStateChange {
        session_id: SessionId,
        state: Option<crate::autorun::BatchRunState>,
    },
    TabsChanged {
        session_id: SessionId,
        tabs: Vec<crate::session::tab::Tab>,
        active_tab_id: Option<TabId>,
    },
    Error { code: &'static str, message: String },
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/:token", get(ws_handler))
        .route("/:token/session/:id/interrupt", post(interrupt_handler))
        .route("/:token/session/:id", get(get_session_handler))
        .with_state(state)
}

async fn ws_handler(
    AxumPath(token): AxumPath<String>,
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, token: String) {
    if token != state.token {
        let _ = socket
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1008, // policy violation
                reason: "invalid token".into(),
            })))
            .await;
        return;
    }

    let sessions = state.registry.list().await;
    let snapshot = ServerEvent::SessionsUpdate {
        sessions,
        theme: serde_json::Value::Null,
        custom_commands: Vec::new(),
    };
    if send_event(&mut socket, &snapshot).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::channel::<ServerEvent>(CLIENT_QUEUE_DEPTH);
    let mut bus_rx = state.bus.subscribe();
    let forward_tx = tx.clone();
    let forward_registry = state.registry.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match bus_rx.recv().await {
                Ok(envelope) => {
                    if let Some(event) = translate(envelope, &forward_registry).await {
                        // try_send: a full queue means the client is too
                        // slow; drop it rather than buffer.
                        if forward_tx.try_send(event).is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &state, &tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    forwarder.abort();
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> std::result::Result<(), axum::Error> {
    let Ok(json) = serde_json::to_string(event) else {
        return Ok(());
    };
    socket.send(Message::Text(json)).await
}

/// Translate an internal bus event into the wire protocol's server event,
/// or `None` for events the gateway doesn't replay. Two
/// variants (`AutorunStateChange`, `TabsChanged`) carry a fresh snapshot
/// rather than a delta, since the bus event itself only names what
/// changed, not the new value.
async fn translate(envelope: Envelope, registry: &SessionRegistry) -> Option<ServerEvent> {
    match envelope.event {
        Event::SessionAdded { session_id } => Some(ServerEvent::SessionAdded { session_id }),
        Event::SessionRemoved { session_id } => Some(ServerEvent::SessionRemoved { session_id }),
        Event::SessionStateChange { session_id } | Event::TabStateChanged { session_id, .. } => {
            Some(ServerEvent::SessionStateChange { session_id })
        }
        Event::SessionOutput {
            session_id, source, text, ..
        } => Some(ServerEvent::SessionOutput {
            session_id,
            source,
            text,
        }),
        Event::UserInput {
            session_id, command, ..
        } => Some(ServerEvent::UserInput {
            session_id,
            command,
            mode: InputMode::Interactive,
        }),
        Event::ActiveSessionChanged { session_id } => Some(ServerEvent::ActiveSessionChanged { session_id }),
        Event::ThemeUpdate => Some(ServerEvent::ThemeUpdate),
        Event::CustomCommands => Some(ServerEvent::CustomCommands),
        Event::AutorunStateChange { session_id } => {
            let state = registry.get(&session_id).await.and_then(|s| s.batch_state);
            Some(ServerEvent::AutorunStateChange { session_id, state })
        }
        Event::TabsChanged {
            session_id,
            active_tab_id,
        } => {
            let tabs = registry.get(&session_id).await.map(|s| s.tabs).unwrap_or_default();
            Some(ServerEvent::TabsChanged {
                session_id,
                tabs,
                active_tab_id,
            })
        }
        Event::HistoryWritten { .. } => None,
    }
}

async fn handle_client_message(text: &str, state: &GatewayState, tx: &mpsc::Sender<ServerEvent>) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = tx
                .try_send(ServerEvent::Error {
                    code: "BadMessage",
                    message: e.to_string(),
                });
            return;
        }
    };

    let outcome: Result<()> = match message {
        ClientMessage::SelectSession { .. } => Ok(()), // local foregrounding only; no state change.
        ClientMessage::SelectTab { session_id, tab_id } => {
            state
                .registry
                .mutate(&session_id, move |s| {
                    s.active_tab_id = Some(tab_id);
                    Ok(())
                })
                .await
                .map(|_| ())
        }
        ClientMessage::NewTab { session_id } => state
            .registry
            .mutate(&session_id, |s| Ok(s.create_tab(None, None, false)))
            .await
            .map(|_| ()),
        ClientMessage::CloseTab { session_id, tab_id } => {
            state
                .registry
                .mutate(&session_id, move |s| s.close_tab(&tab_id))
                .await
        }
        ClientMessage::SendCommand {
            session_id,
            command,
            input_mode: _,
        } => {
            let Some(session) = state.registry.get(&session_id).await else {
                return;
            };
            let Some(tab_id) = session.active_tab_id.clone() else {
                return;
            };
            state
                .supervisor
                .dispatch(&session_id, &tab_id, &command, vec![])
                .await
        }
        ClientMessage::SwitchMode { session_id, mode } => {
            state
                .registry
                .mutate(&session_id, move |s| {
                    s.input_mode = mode;
                    Ok(())
                })
                .await
        }
    };

    if let Err(e) = outcome {
        let _ = tx.try_send(ServerEvent::Error {
            code: e.tag(),
            message: e.to_string(),
        });
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "tabId")]
    tab_id: Option<TabId>,
}

/// `GET /:token/session/:id`.
async fn get_session_handler(
    AxumPath((token, id)): AxumPath<(String, SessionId)>,
    Query(query): Query<SessionQuery>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    if token != state.token {
        return (axum::http::StatusCode::FORBIDDEN, Json(serde_json::json!({"error": "invalid token"})));
    }
    let Some(session) = state.registry.get(&id).await else {
        return (axum::http::StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "session not found"})));
    };

    let body = match query.tab_id {
        Some(tab_id) => {
            let log = session.find_tab(&tab_id).map(|t| &t.log);
            serde_json::json!({ "session": session, "tabId": tab_id, "log": log })
        }
        None => serde_json::json!({ "session": session }),
    };
    (axum::http::StatusCode::OK, Json(body))
}

#[derive(Serialize)]
struct InterruptResponse {
    success: bool,
    error: Option<String>,
}

/// `POST /:token/session/:id/interrupt`.
async fn interrupt_handler(
    AxumPath((token, id)): AxumPath<(String, SessionId)>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    if token != state.token {
        return (
            axum::http::StatusCode::FORBIDDEN,
            Json(InterruptResponse {
                success: false,
                error: Some("invalid token".to_string()),
            }),
        );
    }
    match state.supervisor.interrupt(&id).await {
        Ok(()) | Err(MaestroError::Interrupted) => (
            axum::http::StatusCode::OK,
            Json(InterruptResponse {
                success: true,
                error: None,
            }),
        ),
        Err(e) => (
            axum::http::StatusCode::OK,
            Json(InterruptResponse {
                success: false,
                error: Some(e.to_string()),
            }),
        ),
    }
}

/// Run the full set of Auto Run dispatch requests for `session_id` through
/// a scheduler run, used by the `run` CLI verb as well as remote-triggered
/// Auto Runs. Kept here (rather than in `autorun::scheduler`) since it
/// also needs the playbook store and Auto Run folder resolution that are
/// gateway/CLI concerns, not scheduler-internal ones.
pub async fn run_playbook(
    state: &GatewayState,
    session_id: SessionId,
    playbook_id: crate::ids::PlaybookId,
    autorun_folder: PathBuf,
    options: RunOptions,
) -> Result<()> {
    let playbook = state
        .playbooks
        .get(&session_id, &playbook_id)
        .await
        .ok_or_else(|| MaestroError::PlaybookNotFound(playbook_id.to_string()))?;
    state.scheduler.run(session_id, playbook, autorun_folder, options).await
}
