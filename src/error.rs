//! Tagged error kinds surfaced by the engine: caller errors and
//! agent/scheduler errors are distinct from the general-purpose `anyhow`
//! flow used for setup and I/O.

use thiserror::Error;

/// The kind of agent error reported by a parsed event stream or synthesized
/// by the supervisor (e.g. on interrupt or non-zero exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// The agent process reported an application-level error.
    Reported,
    /// Synthesized after a successful interrupt.
    Interrupted,
    /// The child exited with a non-zero status.
    NonZeroExit,
    /// The adapter's parser lost sync with the byte stream and resynced.
    ParserResync,
}

/// Engine-wide tagged errors. Every variant here is a value returned to a
/// caller, never a panic or a silently dropped failure.
#[derive(Debug, Error)]
pub enum MaestroError {
    #[error("invalid workspace path: {0}")]
    InvalidPath(String),

    #[error("unknown agent kind: {0}")]
    UnknownAgent(String),

    #[error("session {0} is busy (a batch or dispatch is already in flight)")]
    SessionBusy(String),

    #[error("write lock held: another tab in session {session_id} is busy")]
    WriteLocked { session_id: String },

    #[error("tab {tab_id} is busy")]
    TabBusy { tab_id: String },

    #[error("agent not found for kind {0}: executable could not be resolved")]
    AgentNotFound(String),

    #[error("agent error ({kind:?}, recoverable={recoverable}): {message}")]
    AgentError {
        kind: AgentErrorKind,
        message: String,
        recoverable: bool,
    },

    #[error("playbook invalid: {document}: {reason}")]
    PlaybookInvalid { document: String, reason: String },

    #[error("interrupted")]
    Interrupted,

    #[error("persistence failure ({what}): {cause}")]
    PersistenceFailure { what: String, cause: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("tab not found: {0}")]
    TabNotFound(String),

    #[error("playbook not found: {0}")]
    PlaybookNotFound(String),
}

impl MaestroError {
    /// Stable machine-readable tag, used by the CLI's `--json` mode and the
    /// remote gateway's error frames.
    pub fn tag(&self) -> &'static str {
        match self {
            MaestroError::InvalidPath(_) => "InvalidPath",
            MaestroError::UnknownAgent(_) => "UnknownAgent",
            MaestroError::SessionBusy(_) => "SessionBusy",
            MaestroError::WriteLocked { .. } => "WriteLocked",
            MaestroError::TabBusy { .. } => "TabBusy",
            MaestroError::AgentNotFound(_) => "AgentNotFound",
            MaestroError::AgentError { .. } => "AgentError",
            MaestroError::PlaybookInvalid { .. } => "PlaybookInvalid",
            MaestroError::Interrupted => "Interrupted",
            MaestroError::PersistenceFailure { .. } => "PersistenceFailure",
            MaestroError::SessionNotFound(_) => "SessionNotFound",
            MaestroError::TabNotFound(_) => "TabNotFound",
            MaestroError::PlaybookNotFound(_) => "PlaybookNotFound",
        }
    }
}

pub type Result<T> = std::result::Result<T, MaestroError>;

/// Wraps an arbitrary error into an `anyhow::Error` with a consistent
/// "Failed to X" prefix, for the general (non-tagged) flow: config
/// loading, file I/O, setup.
pub trait ResultExt<T> {
    fn context_op(self, op: &str) -> anyhow::Result<T>;
    fn context_path(self, op: &str, path: &std::path::Path) -> anyhow::Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context_op(self, op: &str) -> anyhow::Result<T> {
        use anyhow::Context;
        self.with_context(|| format!("Failed to {op}"))
    }

    fn context_path(self, op: &str, path: &std::path::Path) -> anyhow::Result<T> {
        use anyhow::Context;
        self.with_context(|| format!("Failed to {op} at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable_strings() {
        assert_eq!(MaestroError::InvalidPath("x".into()).tag(), "InvalidPath");
        assert_eq!(
            MaestroError::WriteLocked {
                session_id: "s1".into()
            }
            .tag(),
            "WriteLocked"
        );
        assert_eq!(
            MaestroError::AgentError {
                kind: AgentErrorKind::Interrupted,
                message: "m".into(),
                recoverable: true,
            }
            .tag(),
            "AgentError"
        );
    }

    #[test]
    fn context_op_wraps_with_prefix() {
        let io_err: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk full"));
        let wrapped = io_err.context_op("write sessions.json");
        assert!(wrapped.unwrap_err().to_string().contains("Failed to write sessions.json"));
    }
}
