//! Worker process launcher.
//!
//! The worker is started as `<executable> -tcp <port>` and connects back to
//! the controller's control channel. The process handle is only used to
//! observe exit; payloads never travel over the child's stdio.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;

/// Lowest control port a worker may be told to connect to.
pub const MIN_CONTROL_PORT: u32 = 1024;
/// Highest control port a worker may be told to connect to.
pub const MAX_CONTROL_PORT: u32 = 65535;

/// Command-line flag carrying the control port.
pub const PORT_FLAG: &str = "-tcp";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("control port {0} is outside 1024..=65535")]
    PortOutOfRange(u32),
    #[error("worker executable not found: {}", .0.display())]
    MissingExecutable(PathBuf),
    #[error("worker executable is not a file: {}", .0.display())]
    NotAFile(PathBuf),
}

/// A control port inside the range workers accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlPort(u16);

impl ControlPort {
    pub fn new(port: u32) -> Result<Self, ConfigError> {
        if !(MIN_CONTROL_PORT..=MAX_CONTROL_PORT).contains(&port) {
            return Err(ConfigError::PortOutOfRange(port));
        }
        // In range, so it fits.
        Ok(Self(port as u16))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for ControlPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for ControlPort {
    type Error = ConfigError;

    fn try_from(port: u32) -> Result<Self, Self::Error> {
        Self::new(port)
    }
}

/// Check that the worker executable exists and is a regular file.
pub fn verify_executable(path: &Path) -> Result<(), ConfigError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(ConfigError::NotAFile(path.to_path_buf())),
        Err(_) => Err(ConfigError::MissingExecutable(path.to_path_buf())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, executable: &Path, port: ControlPort) -> Result<Child, SpawnError>;
}

/// Runs the executable directly with `-tcp <port>`.
///
/// stdin is closed, stdout/stderr are inherited from the controller, and on
/// Windows no console window is created.
#[derive(Debug, Default, Clone)]
pub struct ExecutableSpawner {
    env: Vec<(String, String)>,
}

impl ExecutableSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra environment variable for the worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for ExecutableSpawner {
    fn spawn(&self, executable: &Path, port: ControlPort) -> Result<Child, SpawnError> {
        let mut command = Command::new(executable);
        command
            .arg(PORT_FLAG)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        for (key, value) in &self.env {
            command.env(key, value);
        }
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        Ok(command.spawn()?)
    }
}

/// Spawned worker process, held for exit observation only.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
}

impl WorkerProcess {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Hand the child to a detached task that waits for it to exit.
    ///
    /// The task is never joined; callers bound their own wait through the
    /// returned [`ExitWatch`] and may drop it at any time.
    pub fn wait_detached(self) -> ExitWatch {
        let (tx, rx) = oneshot::channel();
        let pid = self.pid;
        let mut child = self.child;
        tokio::spawn(async move {
            let status = child.wait().await;
            match &status {
                Ok(status) => tracing::debug!(?pid, %status, "Worker process exited"),
                Err(e) => tracing::warn!(?pid, error = %e, "Failed to wait for worker process"),
            }
            let _ = tx.send(status);
        });
        ExitWatch { rx, pid }
    }
}

#[derive(Debug)]
pub enum ExitOutcome {
    Exited(ExitStatus),
    WaitFailed(io::Error),
    TimedOut,
}

/// Receiving end of a detached exit wait.
#[derive(Debug)]
pub struct ExitWatch {
    rx: oneshot::Receiver<io::Result<ExitStatus>>,
    pid: Option<u32>,
}

impl ExitWatch {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait up to `timeout` for the process to exit. The detached wait keeps
    /// running after a timeout.
    pub async fn wait(mut self, timeout: Duration) -> ExitOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Ok(status))) => ExitOutcome::Exited(status),
            Ok(Ok(Err(e))) => ExitOutcome::WaitFailed(e),
            Ok(Err(_)) => ExitOutcome::WaitFailed(io::Error::other("exit watcher dropped")),
            Err(_) => ExitOutcome::TimedOut,
        }
    }
}

/// Start the worker through `spawner`.
pub fn launch(
    spawner: &dyn WorkerSpawner,
    executable: &Path,
    port: ControlPort,
) -> Result<WorkerProcess, SpawnError> {
    let child = spawner.spawn(executable, port)?;
    let pid = child.id();
    tracing::info!(
        ?pid,
        port = port.get(),
        executable = %executable.display(),
        "Worker process launched"
    );
    Ok(WorkerProcess { child, pid })
}
