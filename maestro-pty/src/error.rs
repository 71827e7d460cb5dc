use thiserror::Error;

/// Errors surfaced by PTY-backed process management.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("no process has been spawned on this handle")]
    NotSpawned,

    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    #[error("io error communicating with child: {0}")]
    Io(#[from] std::io::Error),

    #[error("child process wait failed: {0}")]
    WaitFailed(String),

    #[error("signal delivery failed: {0}")]
    SignalFailed(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;
