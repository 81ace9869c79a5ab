//! Controller-side handle to an engine process.
//!
//! Spawns `sable-engine`, talks to it over its stdin/stdout and makes sure
//! the process does not outlive the handle.

use std::ffi::OsString;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

use super::channel::{Channel, StdioChannel};
use super::protocol::{Reply, Request};

/// Command-line options passed to a spawned engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub slave_no: u32,
    /// Process the engine watches; defaults to the current process.
    pub parent_pid: u32,
    pub session_dir: Option<PathBuf>,
    /// JSON dataset file.
    pub data: Option<PathBuf>,
    pub poll_ms: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            slave_no: 0,
            parent_pid: std::process::id(),
            session_dir: None,
            data: None,
            poll_ms: None,
        }
    }
}

impl EngineOptions {
    fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--slave".into(),
            self.slave_no.to_string().into(),
            "--parent-pid".into(),
            self.parent_pid.to_string().into(),
        ];
        if let Some(dir) = &self.session_dir {
            args.push("--session-dir".into());
            args.push(dir.into());
        }
        if let Some(data) = &self.data {
            args.push("--data".into());
            args.push(data.into());
        }
        if let Some(poll_ms) = self.poll_ms {
            args.push("--poll-ms".into());
            args.push(poll_ms.to_string().into());
        }
        args
    }
}

/// Handle to a running engine process.
pub struct EngineHandle {
    child: Child,
    channel: StdioChannel<BufWriter<ChildStdin>>,
    killed: bool,
}

impl EngineHandle {
    /// Spawn the engine binary found by [`EngineHandle::find_engine_binary`].
    pub fn spawn(options: &EngineOptions) -> Result<Self> {
        let path = Self::find_engine_binary()?;
        Self::spawn_binary(&path, options)
    }

    /// Spawn a specific engine binary.
    pub fn spawn_binary(path: &Path, options: &EngineOptions) -> Result<Self> {
        let mut child = Command::new(path)
            .args(options.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn engine process '{}': {}",
                    path.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get engine stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get engine stdout".to_string()))?;

        tracing::debug!(pid = child.id(), slave = options.slave_no, "Spawned engine");

        Ok(Self {
            child,
            channel: StdioChannel::new(stdout, BufWriter::new(stdin)),
            killed: false,
        })
    }

    /// Locate the `sable-engine` binary.
    ///
    /// Looks in order at `SABLE_ENGINE_PATH`, the directory of the current
    /// executable, and the system PATH.
    pub fn find_engine_binary() -> Result<PathBuf> {
        let binary_name = if cfg!(windows) {
            "sable-engine.exe"
        } else {
            "sable-engine"
        };

        if let Ok(path) = std::env::var("SABLE_ENGINE_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(exe_path) = std::env::current_exe()
            && let Some(exe_dir) = exe_path.parent()
        {
            let path = exe_dir.join(binary_name);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(path) = which::which(binary_name) {
            return Ok(path);
        }

        Err(Error::Ipc(
            "Could not find sable-engine binary. Set SABLE_ENGINE_PATH or ensure it's in PATH."
                .to_string(),
        ))
    }

    /// Send a request to the engine.
    pub fn send(&mut self, request: &Request) -> Result<()> {
        if self.killed {
            return Err(Error::Ipc("Engine has been killed".to_string()));
        }
        let text = serde_json::to_string(request)?;
        self.channel.send(&text)
    }

    /// Wait up to `timeout` for the next reply.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Reply>> {
        if self.killed {
            return Err(Error::Ipc("Engine has been killed".to_string()));
        }
        match self.channel.receive(timeout)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Wait for the process to exit, up to `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        !self.killed && matches!(self.child.try_wait(), Ok(None))
    }

    /// Process id of the engine.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Kill the engine immediately.
    pub fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;

        if let Err(e) = self.child.kill()
            && e.kind() != std::io::ErrorKind::InvalidInput
        {
            tracing::warn!("Failed to kill engine: {}", e);
        }
        let _ = self.child.wait();
        Ok(())
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        let _ = self.kill();
    }
}
