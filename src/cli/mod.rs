//! Command-line entry point: the single documented
//! verb `run <playbook-id>`, plus the ambient `session`/`playbook`
//! subcommands a standalone binary needs since there is no desktop shell
//! here to create sessions or manage playbooks through.

pub mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::autorun::playbook;
use crate::autorun::RunOptions;
use crate::config::MaestroConfig;
use crate::engine::Engine;
use crate::error::MaestroError;
use crate::ids::{PlaybookId, SessionId};
use crate::session::Session;
use output::create_formatter;

#[derive(Parser)]
#[command(name = "maestro", version, about = "Multiplex coding-agent CLIs across project workspaces")]
pub struct Cli {
    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,
    /// Enable debug-level logging.
    #[arg(long, global = true)]
    pub debug: bool,
    /// Enable trace-level logging (implies --debug).
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a playbook against a session's configured Auto Run folder.
    Run {
        playbook_id: String,
        #[arg(long)]
        session: String,
        /// Build the task plan and report it without dispatching anything.
        #[arg(long)]
        dry_run: bool,
        /// Skip the history entry and badge accounting on completion.
        #[arg(long)]
        no_history: bool,
        /// Poll until the session is idle instead of failing immediately.
        #[arg(long)]
        wait: bool,
    },
    /// Session management (ambient; no desktop shell exists here to do it).
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Playbook import/export (ambient).
    Playbook {
        #[command(subcommand)]
        action: PlaybookAction,
    },
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// Register a new session bound to `workspace`.
    Add {
        workspace: PathBuf,
        /// Agent CLI kind: `claude-code`, `codex`, `aider`, or a custom name.
        #[arg(long, default_value = "claude-code")]
        agent: String,
        #[arg(long)]
        name: Option<String>,
        /// Folder (relative to the workspace) holding Auto Run documents.
        #[arg(long)]
        autorun_folder: Option<PathBuf>,
    },
    /// List every registered session.
    List,
    /// Delete a session and its playbooks.
    Rm { session_id: String },
}

#[derive(Subcommand)]
pub enum PlaybookAction {
    /// Import a playbook zip, copying its documents into `autorun_folder`.
    Import {
        session_id: String,
        archive: PathBuf,
        #[arg(long)]
        autorun_folder: PathBuf,
    },
    /// Export a playbook to a zip.
    Export {
        session_id: String,
        playbook_id: String,
        #[arg(long)]
        autorun_folder: PathBuf,
        out: PathBuf,
    },
}

pub async fn run(cli: Cli) -> ExitCode {
    init_tracing(cli.debug, cli.verbose);

    let config = match MaestroConfig::resolve() {
        Ok(config) => config,
        Err(e) => {
            emit_run_error(cli.json, "ConfigError", &e.to_string());
            return ExitCode::from(1);
        }
    };

    let engine = match Engine::bootstrap(config).await {
        Ok(engine) => engine,
        Err(e) => {
            emit_run_error(cli.json, "BootstrapError", &e.to_string());
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Command::Run {
            playbook_id,
            session,
            dry_run,
            no_history,
            wait,
        } => run_playbook_command(&engine, cli.json, &session, &playbook_id, dry_run, no_history, wait).await,
        Command::Session { action } => session_command(&engine, cli.json, action).await,
        Command::Playbook { action } => playbook_command(&engine, cli.json, action).await,
    }
}

fn init_tracing(debug: bool, verbose: bool) {
    let level = if verbose {
        "trace"
    } else if debug {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("maestro_core={level}")));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Drive one `run <playbook-id>` invocation to completion, mapping the
/// outcome onto the documented exit codes.
async fn run_playbook_command(
    engine: &Engine,
    json: bool,
    session_id_str: &str,
    playbook_id_str: &str,
    dry_run: bool,
    no_history: bool,
    wait: bool,
) -> ExitCode {
    let session_id = SessionId::from(session_id_str.to_string());
    let Some(session) = engine.registry.get(&session_id).await else {
        emit_run_error(json, "SessionNotFound", &format!("session not found: {session_id_str}"));
        return ExitCode::from(1);
    };

    let Some(autorun_folder) = session.autorun.folder.clone() else {
        emit_run_error(json, "NoAutoRunFolder", "session has no Auto Run folder configured");
        return ExitCode::from(5);
    };

    let playbook_id = PlaybookId::from(playbook_id_str.to_string());
    let Some(playbook) = engine.playbooks.get(&session_id, &playbook_id).await else {
        emit_run_error(json, "PlaybookNotFound", &format!("playbook not found: {playbook_id_str}"));
        return ExitCode::from(2);
    };

    // Fail fast on an unsupported or unresolvable agent before touching the
    // scheduler: its own dispatch path only reports these as a generic
    // task-level agent error, which would blur exit codes 3 and 6 together.
    let adapter = match engine.adapters.get(&session.agent_kind) {
        Ok(adapter) => adapter,
        Err(_) => {
            emit_run_error(json, "UnknownAgent", "unsupported agent kind");
            return ExitCode::from(6);
        }
    };
    if adapter.resolve_executable(None).is_err() {
        emit_run_error(json, "AgentNotFound", "agent CLI not found on PATH");
        return ExitCode::from(3);
    }

    if wait {
        while crate::autorun::scheduler::is_session_busy(&engine.config, &session_id).await {
            tracing::info!(session = %session_id_str, "still waiting: session busy");
            tokio::time::sleep(crate::config::CLI_WAIT_POLL_INTERVAL).await;
        }
    }

    let event_printer = json.then(|| spawn_event_printer(engine, session_id.clone()));
    let options = RunOptions {
        dry_run,
        no_history,
        wait,
    };
    let outcome = engine.scheduler.run(session_id, playbook, autorun_folder, options).await;
    if let Some(handle) = event_printer {
        handle.abort();
    }

    match outcome {
        Ok(()) => {
            emit_run_success(json, "Auto Run completed");
            ExitCode::from(0)
        }
        Err(MaestroError::SessionBusy(_)) => {
            emit_run_error(json, "SessionBusy", "session is busy; pass --wait to poll until idle");
            ExitCode::from(4)
        }
        Err(e) => {
            emit_run_error(json, e.tag(), &e.to_string());
            ExitCode::from(1)
        }
    }
}

/// In `--json` mode, print one JSON object per scheduler event
/// by relaying `AutorunStateChange` off the bus for the duration of the run.
fn spawn_event_printer(engine: &Engine, session_id: SessionId) -> tokio::task::JoinHandle<()> {
    let mut receiver = engine.bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    if let crate::bus::Event::AutorunStateChange { session_id: sid } = &envelope.event {
                        if sid == &session_id {
                            println!(
                                "{}",
                                serde_json::json!({"type": "autorun_state_change", "sessionId": sid.as_str()})
                            );
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn emit_run_success(json: bool, message: &str) {
    if json {
        println!("{}", serde_json::json!({"type": "success", "message": message}));
    } else {
        println!("{}", create_formatter(false).format_success(message, None));
    }
}

fn emit_run_error(json: bool, code: &str, message: &str) {
    if json {
        println!("{}", serde_json::json!({"type": "error", "code": code, "message": message}));
    } else {
        eprintln!("{}", create_formatter(false).format_error(message));
    }
}

async fn session_command(engine: &Engine, json: bool, action: SessionAction) -> ExitCode {
    let formatter = create_formatter(json);
    match action {
        SessionAction::Add {
            workspace,
            agent,
            name,
            autorun_folder,
        } => {
            let display_name = name.unwrap_or_else(|| {
                workspace
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| workspace.display().to_string())
            });
            match engine
                .create_session(workspace.clone(), parse_agent_kind(&agent), display_name)
                .await
            {
                Ok(id) => {
                    if let Some(folder) = autorun_folder {
                        let _ = engine
                            .registry
                            .mutate(&id, move |s| {
                                s.autorun.folder = Some(folder.clone());
                                Ok(())
                            })
                            .await;
                    }
                    println!(
                        "{}",
                        formatter.format_success("session created", Some(serde_json::json!({"sessionId": id.as_str()})))
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", formatter.format_error(&e.to_string()));
                    ExitCode::from(1)
                }
            }
        }
        SessionAction::List => {
            let sessions: Vec<Session> = engine.list_sessions().await;
            println!("{}", formatter.format_list(&sessions, "Sessions"));
            ExitCode::SUCCESS
        }
        SessionAction::Rm { session_id } => match engine.remove_session(&SessionId::from(session_id)).await {
            Ok(()) => {
                println!("{}", formatter.format_success("session removed", None));
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", formatter.format_error(&e.to_string()));
                ExitCode::from(1)
            }
        },
    }
}

async fn playbook_command(engine: &Engine, json: bool, action: PlaybookAction) -> ExitCode {
    let formatter = create_formatter(json);
    match action {
        PlaybookAction::Import {
            session_id,
            archive,
            autorun_folder,
        } => {
            let session_id = SessionId::from(session_id);
            match playbook::import_zip(&archive, &autorun_folder) {
                Ok(playbook) => {
                    let id = playbook.id.clone();
                    if let Err(e) = engine.playbooks.upsert(&session_id, playbook).await {
                        eprintln!("{}", formatter.format_error(&e.to_string()));
                        return ExitCode::from(1);
                    }
                    println!(
                        "{}",
                        formatter.format_success("playbook imported", Some(serde_json::json!({"playbookId": id.as_str()})))
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", formatter.format_error(&e.to_string()));
                    ExitCode::from(1)
                }
            }
        }
        PlaybookAction::Export {
            session_id,
            playbook_id,
            autorun_folder,
            out,
        } => {
            let session_id = SessionId::from(session_id);
            let playbook_id = PlaybookId::from(playbook_id);
            let Some(playbook) = engine.playbooks.get(&session_id, &playbook_id).await else {
                eprintln!("{}", formatter.format_error("playbook not found"));
                return ExitCode::from(2);
            };
            let exported_at_ms = chrono::Utc::now().timestamp_millis();
            match playbook::export_zip(&playbook, &autorun_folder, &out, exported_at_ms) {
                Ok(()) => {
                    println!("{}", formatter.format_success("playbook exported", None));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", formatter.format_error(&e.to_string()));
                    ExitCode::from(1)
                }
            }
        }
    }
}

fn parse_agent_kind(name: &str) -> crate::adapter::AgentKind {
    match name {
        "claude-code" => crate::adapter::AgentKind::ClaudeCode,
        "codex" => crate::adapter::AgentKind::Codex,
        "aider" => crate::adapter::AgentKind::Aider,
        other => crate::adapter::AgentKind::Custom(other.to_string()),
    }
}
