//! Remote engine controller - owns the worker and multiplexes operations.
//!
//! Flow:
//! 1. Verify the worker executable and any fixed port
//! 2. Start the control channel, learn its port
//! 3. Launch the worker with `-tcp <port>`
//! 4. Callers wait for the handshake, then each `find`/`find_and_run`
//!    registers a sink and sends one tagged command
//! 5. Dispose: close the channel, drop registrations, then give the worker
//!    a bounded grace period to exit

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use crate::bridge::protocol::{Envelope, OperationId};
use crate::channel::{ChannelError, ConnectionState, ControlChannel, FrameHandler};
use crate::diagnostics::{DiagnosticLevel, DiagnosticSink, TracingDiagnostics};
use crate::launcher::{
    self, ConfigError, ControlPort, ExecutableSpawner, ExitOutcome, SpawnError, WorkerProcess,
    WorkerSpawner, verify_executable,
};
use crate::registry::{OperationRegistry, ResultSink};
use crate::teardown::{TeardownFailure, TeardownStack};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(5_000);

pub struct ControllerConfig {
    pub worker_path: PathBuf,
    /// Fixed control port; `None` binds an ephemeral one.
    pub port: Option<u32>,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl ControllerConfig {
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: worker_path.into(),
            port: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            spawner: Arc::new(ExecutableSpawner::new()),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    pub fn with_port(mut self, port: u32) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to launch worker: {0}")]
    Launch(#[from] SpawnError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("worker did not connect within {}ms", .waited.as_millis())]
    NotReady { waited: Duration },
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("controller already disposed")]
    AlreadyDisposed,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Find,
    FindAndRun,
}

impl Command {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::FindAndRun => "run",
        }
    }

    fn envelope(self, op: OperationId, settings: serde_json::Value) -> Envelope {
        match self {
            Self::Find => Envelope::find(op, settings),
            Self::FindAndRun => Envelope::run(op, settings),
        }
    }
}

pub struct RemoteEngineController {
    channel: Arc<ControlChannel>,
    registry: Arc<OperationRegistry>,
    process: StdMutex<Option<WorkerProcess>>,
    teardown: StdMutex<Option<TeardownStack>>,
    diagnostics: Arc<dyn DiagnosticSink>,
    ready_timeout: Duration,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl RemoteEngineController {
    /// Start the control channel and launch the worker.
    ///
    /// Configuration problems are reported before anything is bound or spawned.
    pub async fn start(config: ControllerConfig) -> Result<Self, ControllerError> {
        verify_executable(&config.worker_path)?;
        let fixed_port = config.port.map(ControlPort::new).transpose()?;

        let registry = Arc::new(OperationRegistry::new(Arc::clone(&config.diagnostics)));
        let mut teardown = TeardownStack::new();
        {
            let registry = Arc::clone(&registry);
            teardown.push("operation registrations", async move {
                let pending = registry.clear();
                if pending > 0 {
                    tracing::debug!(pending, "Dropped in-flight operations");
                }
                Ok(())
            });
        }

        let channel = match ControlChannel::start(
            fixed_port,
            Arc::clone(&registry) as Arc<dyn FrameHandler>,
        )
        .await
        {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                report_release_failures(config.diagnostics.as_ref(), teardown.unwind().await);
                return Err(e.into());
            }
        };
        {
            let channel = Arc::clone(&channel);
            teardown.push("control channel", async move {
                channel.close().await;
                Ok(())
            });
        }

        let port = match ControlPort::new(u32::from(channel.port())) {
            Ok(port) => port,
            Err(e) => {
                report_release_failures(config.diagnostics.as_ref(), teardown.unwind().await);
                return Err(e.into());
            }
        };

        tracing::info!(port = port.get(), worker = %config.worker_path.display(), "Launching worker");
        let process = match launcher::launch(config.spawner.as_ref(), &config.worker_path, port) {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(error = %e, "Worker launch failed");
                report_release_failures(config.diagnostics.as_ref(), teardown.unwind().await);
                return Err(e.into());
            }
        };

        Ok(Self {
            channel,
            registry,
            process: StdMutex::new(Some(process)),
            teardown: StdMutex::new(Some(teardown)),
            diagnostics: config.diagnostics,
            ready_timeout: config.ready_timeout,
            poll_interval: config.poll_interval,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn port(&self) -> u16 {
        self.channel.port()
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn is_ready(&self) -> bool {
        self.channel.is_ready()
    }

    /// Operations whose sinks have not completed yet.
    pub fn pending_operations(&self) -> usize {
        self.registry.len()
    }

    /// Discover tests. Results stream into `sink` until it sees completion.
    pub async fn find(
        &self,
        sink: Arc<dyn ResultSink>,
        settings: serde_json::Value,
    ) -> Result<OperationId, ControllerError> {
        self.find_with_timeout(sink, settings, self.ready_timeout)
            .await
    }

    pub async fn find_with_timeout(
        &self,
        sink: Arc<dyn ResultSink>,
        settings: serde_json::Value,
        ready_timeout: Duration,
    ) -> Result<OperationId, ControllerError> {
        self.submit(Command::Find, sink, settings, ready_timeout)
            .await
    }

    /// Discover and execute tests.
    pub async fn find_and_run(
        &self,
        sink: Arc<dyn ResultSink>,
        settings: serde_json::Value,
    ) -> Result<OperationId, ControllerError> {
        self.find_and_run_with_timeout(sink, settings, self.ready_timeout)
            .await
    }

    pub async fn find_and_run_with_timeout(
        &self,
        sink: Arc<dyn ResultSink>,
        settings: serde_json::Value,
        ready_timeout: Duration,
    ) -> Result<OperationId, ControllerError> {
        self.submit(Command::FindAndRun, sink, settings, ready_timeout)
            .await
    }

    /// Run previously discovered tests by id. Not supported by this controller.
    pub async fn run(
        &self,
        _sink: Arc<dyn ResultSink>,
        _settings: serde_json::Value,
    ) -> Result<OperationId, ControllerError> {
        Err(ControllerError::Unsupported(
            "run by test id is not implemented; use find_and_run",
        ))
    }

    /// Wait until the worker has completed its handshake.
    ///
    /// Polls the connection state every `poll_interval`; never blocks the
    /// channel task or other callers.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), ControllerError> {
        if self.channel.is_ready() {
            return Ok(());
        }

        let channel = &self.channel;
        let poll_interval = self.poll_interval;
        tokio::time::timeout(timeout, async {
            while !channel.is_ready() {
                tokio::time::sleep(poll_interval).await;
            }
        })
        .await
        .map_err(|_| {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                state = %channel.state(),
                "Worker not ready in time"
            );
            ControllerError::NotReady { waited: timeout }
        })
    }

    async fn submit(
        &self,
        command: Command,
        sink: Arc<dyn ResultSink>,
        settings: serde_json::Value,
        ready_timeout: Duration,
    ) -> Result<OperationId, ControllerError> {
        self.wait_until_ready(ready_timeout).await?;

        let op = OperationId::new();
        // Register first so results cannot overtake the registration.
        self.registry.register(op, sink);
        if let Err(e) = self.channel.send(command.envelope(op, settings)).await {
            self.registry.remove(&op);
            tracing::warn!(%op, command = command.as_str(), error = %e, "Failed to send command");
            return Err(e.into());
        }

        tracing::debug!(%op, command = command.as_str(), "Command sent");
        Ok(op)
    }

    /// Close the channel and drop registrations, then give the worker
    /// `shutdown_grace` to exit.
    ///
    /// A worker that outlives the grace period is reported through the
    /// diagnostic sink and left to a detached exit wait. Disposing twice is
    /// a caller bug and fails with [`ControllerError::AlreadyDisposed`].
    pub async fn dispose(&self) -> Result<(), ControllerError> {
        let teardown = match self.teardown.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or(ControllerError::AlreadyDisposed)?;

        tracing::info!(port = self.port(), "Disposing controller");
        report_release_failures(self.diagnostics.as_ref(), teardown.unwind().await);

        let process = match self.process.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(process) = process else {
            return Ok(());
        };

        let pid = process.id();
        match process.wait_detached().wait(self.shutdown_grace).await {
            ExitOutcome::Exited(status) => {
                tracing::info!(?pid, %status, "Worker exited");
            }
            ExitOutcome::WaitFailed(e) => {
                tracing::warn!(?pid, error = %e, "Could not observe worker exit");
            }
            ExitOutcome::TimedOut => {
                let grace_ms = self.shutdown_grace.as_millis();
                tracing::warn!(?pid, grace_ms = grace_ms as u64, "Worker still running after grace period");
                let who = pid.map_or_else(|| "worker process".to_string(), |pid| format!("worker process {pid}"));
                self.diagnostics.warning(&format!(
                    "{who} did not exit within {grace_ms}ms of shutdown; no longer waiting for it"
                ));
            }
        }
        Ok(())
    }
}

fn report_release_failures(diagnostics: &dyn DiagnosticSink, failures: Vec<TeardownFailure>) {
    for failure in failures {
        diagnostics.message(
            DiagnosticLevel::Error,
            &format!("failed to release {}: {}", failure.label, failure.message),
        );
    }
}

impl Drop for RemoteEngineController {
    fn drop(&mut self) {
        let undisposed = match self.teardown.get_mut() {
            Ok(teardown) => teardown.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        };
        if undisposed {
            tracing::warn!(port = self.channel.port(), "Controller dropped without dispose");
        }
    }
}
