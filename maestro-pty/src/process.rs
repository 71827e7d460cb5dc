//! High-level child process lifecycle on top of [`crate::pty::PtyHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::pty::{CommandSpec, PtyHandle};

/// Default grace period between SIGINT and the SIGTERM/SIGKILL escalation,
/// matching the 10s deadline the supervisor documents for interrupts.
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(10);

/// Outcome of an interrupt attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The child exited on its own after SIGINT, within the grace period.
    ExitedGracefully,
    /// The grace period elapsed; the supervisor escalated to SIGTERM then
    /// SIGKILL.
    Escalated,
}

/// A supervised child process: a PTY handle plus the bookkeeping the
/// process supervisor needs (streaming receiver, pid).
///
/// The output receiver is wrapped in a `Mutex` rather than requiring
/// exclusive (`&mut self`) access, so callers can hold `Arc<AgentProcess>`
/// shared between the reader task and the handles used for writing input
/// or sending signals (see `crate::supervisor`).
pub struct AgentProcess {
    pty: Arc<PtyHandle>,
    output: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl AgentProcess {
    /// Spawn `spec` in a fresh PTY of the given size and start streaming
    /// its combined stdout/stderr.
    pub async fn spawn(spec: CommandSpec, rows: u16, cols: u16) -> Result<Self> {
        let pty = Arc::new(PtyHandle::new(rows, cols)?);
        pty.spawn(spec).await?;
        let output = Mutex::new(pty.stream_output());
        Ok(Self { pty, output })
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.pty.write(data).await
    }

    /// Receive the next output chunk, or `None` once the child has
    /// exited and all buffered output has been drained. Only the
    /// supervisor's single reader task per process calls this, so the
    /// lock is never contended.
    pub async fn next_chunk(&self) -> Option<Vec<u8>> {
        self.output.lock().await.recv().await
    }

    pub fn is_running(&self) -> bool {
        self.pty.is_running()
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.pty.exit_code()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    /// Request interrupt: send SIGINT, wait up to `grace` for the child to
    /// exit on its own, otherwise escalate to SIGTERM then SIGKILL.
    ///
    /// This convenience method judges "handled the interrupt" by process
    /// exit, which fits one-shot commands. A long-lived interactive agent
    /// is expected to catch SIGINT, abandon its current response, and
    /// keep running — callers supervising that case (see
    /// `crate::supervisor`) should use [`Self::send_interrupt_signal`] and
    /// [`Self::escalate`] directly with their own notion of "settled".
    pub async fn interrupt(&self, grace: Duration) -> Result<InterruptOutcome> {
        self.send_interrupt_signal()?;

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.pty.is_running() {
                return Ok(InterruptOutcome::ExitedGracefully);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if !self.pty.is_running() {
            return Ok(InterruptOutcome::ExitedGracefully);
        }

        self.escalate().await?;
        Ok(InterruptOutcome::Escalated)
    }

    /// Send only the initial interrupt signal (SIGINT to the process
    /// group, or an adapter-documented alternative), without waiting.
    pub fn send_interrupt_signal(&self) -> Result<()> {
        self.pty.interrupt()
    }

    pub fn send_terminate_signal(&self) -> Result<()> {
        self.pty.terminate()
    }

    /// SIGTERM, then SIGKILL if the child hasn't exited within 2s.
    pub async fn escalate(&self) -> Result<()> {
        self.pty.terminate()?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        if self.pty.is_running() {
            self.pty.kill()?;
        }
        Ok(())
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.pty.resize(rows, cols).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn interrupt_on_already_exited_process_is_graceful() {
        let spec = CommandSpec::new("true", std::env::temp_dir());
        let process = AgentProcess::spawn(spec, 24, 80).await.unwrap();

        // give it time to exit on its own
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        let outcome = process
            .interrupt(StdDuration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(outcome, InterruptOutcome::ExitedGracefully);
    }
}
