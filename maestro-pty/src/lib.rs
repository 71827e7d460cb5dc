//! PTY-backed child process management for long-running interactive CLI
//! agents.
//!
//! Agent CLIs (`claude`, `codex`, and similar) expect a real TTY and stream
//! output indefinitely rather than exiting after one request/response, so
//! this crate drives them through a pseudo-terminal and exposes output as
//! an async channel of byte chunks instead of a one-shot
//! [`std::process::Output`].

pub mod error;
pub mod process;
pub mod pty;

pub use error::{PtyError, Result};
pub use process::{AgentProcess, InterruptOutcome, DEFAULT_INTERRUPT_GRACE};
pub use pty::{shell_spec, CommandSpec, PtyHandle};
