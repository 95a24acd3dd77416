//! Worker runtime - the other end of the control channel.
//!
//! A worker executable is started as `<exe> -tcp <port>`, connects to the
//! controller on localhost, sends its handshake, then serves commands until
//! the controller closes the socket.
//!
//! Each `find`/`run` command runs in its own task. Everything it produces is
//! tagged with the command's operation id and followed by one `complete`
//! envelope; all tasks write through a single outbound queue so frames from
//! one operation keep their order.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Envelope, MessageKind, OperationId};
use crate::launcher::{ConfigError, ControlPort, PORT_FLAG};
use crate::version::WorkerInfo;

/// Handle for streaming results of one operation back to the controller.
///
/// Clonable and usable from any task; frames are queued and written by the
/// worker's event loop.
#[derive(Clone)]
pub struct ResultWriter {
    op: OperationId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ResultWriter {
    pub fn new(op: OperationId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { op, tx }
    }

    pub fn operation(&self) -> OperationId {
        self.op
    }

    pub fn send_result(&self, record: serde_json::Value) -> io::Result<()> {
        self.push(Envelope::result(self.op, record))
    }

    pub fn send_diagnostic(&self, message: &str) -> io::Result<()> {
        if message.is_empty() {
            return Ok(());
        }
        self.push(Envelope::diagnostic(self.op, message))
    }

    fn push(&self, envelope: Envelope) -> io::Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "control channel closed"))
    }
}

/// Failure reported by a [`TestEngine`]. Sent as the `complete` error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid settings: {message}")]
    Settings { message: String },

    #[error("discovery failed: {message}")]
    Discovery { message: String },

    #[error("execution failed: {message}")]
    Execution { message: String },
}

impl EngineError {
    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings {
            message: message.into(),
        }
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }
}

/// The test engine a worker hosts.
#[async_trait::async_trait]
pub trait TestEngine: Send + Sync + 'static {
    /// Discover tests, writing one result per test found.
    async fn find(
        &self,
        settings: serde_json::Value,
        writer: ResultWriter,
    ) -> Result<(), EngineError>;

    /// Discover and execute tests, writing one result per outcome.
    async fn run(
        &self,
        settings: serde_json::Value,
        writer: ResultWriter,
    ) -> Result<(), EngineError>;

    /// Engine name reported in the handshake.
    fn name(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("missing -tcp <port> argument")]
    MissingPort,
    #[error("-tcp expects a port number, got {0:?}")]
    NotANumber(String),
    #[error(transparent)]
    Port(#[from] ConfigError),
}

/// Find `-tcp <port>` among the process arguments.
pub fn parse_port_args<I, S>(args: I) -> Result<ControlPort, ArgsError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg.as_ref() != PORT_FLAG {
            continue;
        }
        let value = args.next().ok_or(ArgsError::MissingPort)?;
        let value = value.as_ref();
        let port: u32 = value
            .parse()
            .map_err(|_| ArgsError::NotANumber(value.to_string()))?;
        return Ok(ControlPort::new(port)?);
    }
    Err(ArgsError::MissingPort)
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub port: ControlPort,
}

impl WorkerConfig {
    pub fn new(port: ControlPort) -> Self {
        Self { port }
    }

    /// Build from process arguments (program name included or not).
    pub fn from_args<I, S>(args: I) -> Result<Self, ArgsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::new(parse_port_args(args)?))
    }
}

/// Run the worker event loop.
///
/// Returns `Ok(())` when the controller closes the channel.
pub async fn run_worker<E: TestEngine>(engine: Arc<E>, config: WorkerConfig) -> io::Result<()> {
    let port = config.port.get();
    tracing::trace!(port, "Connecting to control channel");
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY on control socket");
    }
    tracing::info!(port, "Connected to control channel");

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<Envelope>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<Envelope>::new());

    let mut info = WorkerInfo::new();
    if let Some(name) = engine.name() {
        info = info.with_engine(name);
    }
    writer.send(Envelope::handshake(info.to_body())).await?;
    tracing::debug!(pid = info.pid, "Handshake sent");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let mut operations = JoinSet::new();

    // Writes happen off the read loop so a stalled write never hides EOF.
    let mut write_task = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            writer.send(envelope).await?;
        }
        Ok::<(), io::Error>(())
    });

    loop {
        tokio::select! {
            biased;

            written = &mut write_task => {
                match written {
                    Ok(Err(e)) => tracing::error!(error = %e, "Control channel write failed"),
                    Ok(Ok(())) => tracing::debug!("Outbound queue closed"),
                    Err(e) => tracing::error!(error = %e, "Control channel writer panicked"),
                }
                break;
            }

            frame = reader.next() => {
                match frame {
                    Some(Ok(Ok(envelope))) => {
                        dispatch_command(&engine, envelope, &out_tx, &mut operations);
                    }
                    Some(Ok(Err(e))) => {
                        tracing::warn!(error = %e, "Dropping malformed command frame");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Control channel error");
                        break;
                    }
                    None => {
                        tracing::info!("Controller closed control channel, exiting");
                        break;
                    }
                }
            }

            Some(joined) = operations.join_next(), if !operations.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Operation task panicked");
                }
            }
        }
    }

    operations.abort_all();
    write_task.abort();
    Ok(())
}

fn dispatch_command<E: TestEngine>(
    engine: &Arc<E>,
    envelope: Envelope,
    out_tx: &mpsc::UnboundedSender<Envelope>,
    operations: &mut JoinSet<()>,
) {
    let Envelope { op, kind, body } = envelope;
    let discover_only = match &kind {
        MessageKind::Find => true,
        MessageKind::Run => false,
        other => {
            tracing::warn!(%op, kind = %other, "Unsupported command");
            let _ = out_tx.send(Envelope::diagnostic(
                OperationId::BROADCAST,
                format!("worker does not handle {other} commands"),
            ));
            return;
        }
    };

    tracing::debug!(%op, %kind, "Command received");
    let engine = Arc::clone(engine);
    let out_tx = out_tx.clone();
    operations.spawn(async move {
        let writer = ResultWriter::new(op, out_tx.clone());
        let outcome = if discover_only {
            engine.find(body, writer).await
        } else {
            engine.run(body, writer).await
        };
        let error = match outcome {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(%op, error = %e, "Operation failed");
                Some(e.to_string())
            }
        };
        tracing::debug!(%op, failed = error.is_some(), "Operation complete");
        let _ = out_tx.send(Envelope::complete(op, error));
    });
}
