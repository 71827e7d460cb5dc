//! PTY (pseudo-terminal) backed child process handling.
//!
//! Agent CLIs expect an interactive TTY (they probe isatty, draw spinners,
//! etc.), so every child is spawned through a PTY rather than a plain pipe,
//! mirroring how the upstream session library drives `claude`/`codex`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use crate::error::{PtyError, Result};

/// Argv, working directory and environment for a child process.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn to_command_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        for arg in &self.args {
            cmd.arg(arg);
        }
        cmd.cwd(&self.cwd);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

/// Handle to a single PTY-backed child process.
///
/// Mirrors the ai-session `PtyHandle` shape: a fixed-size PTY, a child
/// handle, and split reader/writer handles guarded by blocking mutexes
/// (the PTY's own read/write calls are blocking syscalls, so they are
/// only ever touched from `spawn_blocking`).
pub struct PtyHandle {
    size: Mutex<PtySize>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
    reader: Arc<Mutex<Option<Box<dyn Read + Send>>>>,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
    pid: Mutex<Option<u32>>,
}

impl PtyHandle {
    pub fn new(rows: u16, cols: u16) -> Result<Self> {
        Ok(Self {
            size: Mutex::new(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }),
            child: Arc::new(Mutex::new(None)),
            reader: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
            pid: Mutex::new(None),
        })
    }

    /// Spawn `spec` inside this PTY. May only be called once per handle.
    pub async fn spawn(&self, spec: CommandSpec) -> Result<()> {
        let size = *self.size.lock().unwrap();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let cmd = spec.to_command_builder();
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        *self.pid.lock().unwrap() = child.process_id();
        *self.child.lock().unwrap() = Some(child);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        *self.reader.lock().unwrap() = Some(reader);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        *self.writer.lock().unwrap() = Some(writer);

        Ok(())
    }

    /// Write raw bytes to the child's stdin (the PTY master).
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let writer = self.writer.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = writer.lock().unwrap();
            let w = guard.as_mut().ok_or(PtyError::NotSpawned)?;
            w.write_all(&data)?;
            w.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::other(e)))?
    }

    /// Non-blocking read of whatever output chunk is currently available.
    /// Returns an empty vec if nothing is ready yet or the child has no
    /// more output.
    pub async fn read_chunk(&self) -> Result<Vec<u8>> {
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut guard = reader.lock().unwrap();
            let r = guard.as_mut().ok_or(PtyError::NotSpawned)?;
            let mut buf = vec![0u8; 8192];
            match r.read(&mut buf) {
                Ok(0) => Ok(Vec::new()),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(buf)
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
                Err(e) => Err(PtyError::Io(e)),
            }
        })
        .await
        .map_err(|e| PtyError::Io(std::io::Error::other(e)))?
    }

    /// Spawn a background task that reads chunks until the child exits or
    /// the returned sender's receiver is dropped, forwarding every
    /// non-empty chunk. This is how the supervisor turns the polling PTY
    /// reader into a normal async stream.
    pub fn stream_output(self: &Arc<Self>) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(256);
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match handle.read_chunk().await {
                    Ok(chunk) if !chunk.is_empty() => {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {
                        if !handle.is_running() {
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                    }
                    Err(_) => break,
                }
            }
        });
        rx
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        *self.size.lock().unwrap() = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        Ok(())
    }

    pub fn size(&self) -> (u16, u16) {
        let size = self.size.lock().unwrap();
        (size.rows, size.cols)
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }

    /// `true` until the child has been observed to exit via `try_wait`.
    pub fn is_running(&self) -> bool {
        let mut guard = self.child.lock().unwrap();
        match guard.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }

    /// Exit code if the child has terminated, `None` if still running or
    /// never spawned.
    pub fn exit_code(&self) -> Option<u32> {
        let mut guard = self.child.lock().unwrap();
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Send SIGINT to the child's process group (unix). On non-unix
    /// targets this falls back to a hard kill.
    #[cfg(unix)]
    pub fn interrupt(&self) -> Result<()> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pid = self.pid().ok_or(PtyError::NotSpawned)?;
        killpg(Pid::from_raw(pid as i32), Signal::SIGINT)
            .map_err(|e| PtyError::SignalFailed(e.to_string()))
    }

    #[cfg(not(unix))]
    pub fn interrupt(&self) -> Result<()> {
        self.kill()
    }

    #[cfg(unix)]
    pub fn terminate(&self) -> Result<()> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pid = self.pid().ok_or(PtyError::NotSpawned)?;
        killpg(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| PtyError::SignalFailed(e.to_string()))
    }

    #[cfg(not(unix))]
    pub fn terminate(&self) -> Result<()> {
        self.kill()
    }

    /// Hard kill: SIGKILL on unix, `TerminateProcess` elsewhere.
    pub fn kill(&self) -> Result<()> {
        let mut guard = self.child.lock().unwrap();
        if let Some(child) = guard.as_mut() {
            child
                .kill()
                .map_err(|e| PtyError::SignalFailed(e.to_string()))?;
        }
        Ok(())
    }
}

/// Build a `CommandSpec` for the host shell (used by tests and by any
/// adapter that needs a plain interactive shell rather than an agent CLI).
pub fn shell_spec(cwd: &Path, env: &HashMap<String, String>) -> CommandSpec {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let mut spec = CommandSpec::new(shell, cwd.to_path_buf());
    for (k, v) in env {
        spec = spec.env(k, v);
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn spawn_and_read_echo() {
        let pty = PtyHandle::new(24, 80).unwrap();
        let spec = CommandSpec::new("echo", std::env::temp_dir()).arg("hello-maestro");
        pty.spawn(spec).await.unwrap();

        let mut collected = Vec::new();
        for _ in 0..50 {
            let chunk = pty.read_chunk().await.unwrap();
            if !chunk.is_empty() {
                collected.extend_from_slice(&chunk);
            }
            if !pty.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("hello-maestro"), "output was: {text:?}");
    }

    #[tokio::test]
    async fn shell_spec_uses_env() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let spec = shell_spec(&std::env::temp_dir(), &env);
        assert_eq!(spec.env.get("FOO"), Some(&"bar".to_string()));
    }
}
