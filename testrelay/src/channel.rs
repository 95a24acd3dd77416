//! Control channel - the single TCP connection to the worker.
//!
//! Flow:
//! 1. Bind a localhost listener (ephemeral port unless one is configured)
//! 2. Accept exactly one connection
//! 3. Wait for the worker's handshake frame
//! 4. Run the read/write loop until closed locally or by the peer
//!
//! One spawned task owns the listener and the socket for the channel's
//! whole lifetime. Callers talk to it through an outbound queue and observe
//! it through the atomic [`ConnectionState`].

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Envelope, MessageKind};
use crate::launcher::ControlPort;
use crate::version::WorkerInfo;

/// Connection lifecycle, in order of occurrence.
///
/// Transitions only move forward; a channel never returns to `Connected`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Initialized = 0,
    Listening = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 5] = [
        Self::Initialized,
        Self::Listening,
        Self::Connected,
        Self::Disconnecting,
        Self::Disconnected,
    ];

    /// True once a handshake has happened, even if the peer is gone since.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Disconnecting | Self::Disconnected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Listening => "listening",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initialized,
            1 => Self::Listening,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder for [`ConnectionState`] that only moves forward.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Initialized as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns false (and changes nothing) otherwise.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let advanced = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok();
        if advanced {
            tracing::trace!(state = %next, "Control channel state changed");
        }
        advanced
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to bind control listener: {0}")]
    Bind(#[source] io::Error),
    #[error("control channel is not connected (state: {0})")]
    NotConnected(ConnectionState),
    #[error("control channel closed")]
    Closed,
    #[error("control channel write failed: {0}")]
    Io(#[from] io::Error),
}

/// A frame that could not be used. Never fatal to the read loop.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected {0} frame before handshake")]
    UnexpectedBeforeHandshake(MessageKind),
}

/// Receives inbound traffic from the channel's read loop.
///
/// Called on the channel task; implementations must not block.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, envelope: Envelope);

    fn on_protocol_error(&self, error: &ProtocolError);
}

type Outbound = (Envelope, oneshot::Sender<io::Result<()>>);
type EnvelopeReader = FramedRead<OwnedReadHalf, JsonCodec<Envelope>>;

pub struct ControlChannel {
    port: u16,
    state: Arc<StateCell>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    /// Bind the listener and start the channel task.
    ///
    /// `bind` pins the port; `None` lets the OS pick an ephemeral one.
    pub async fn start(
        bind: Option<ControlPort>,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Self, ChannelError> {
        let state = Arc::new(StateCell::new());
        let requested = bind.map(ControlPort::get).unwrap_or(0);

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, requested))
            .await
            .map_err(ChannelError::Bind)?;
        let port = listener.local_addr().map_err(ChannelError::Bind)?.port();
        state.advance(ConnectionState::Listening);
        tracing::info!(port, "Control channel listening");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_channel(
            listener,
            Arc::clone(&state),
            handler,
            outbound_rx,
            shutdown.clone(),
        ));

        Ok(Self {
            port,
            state,
            outbound: outbound_tx,
            shutdown,
            task: StdMutex::new(Some(task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Write one envelope to the worker.
    ///
    /// Returns once the frame is in the socket, or fails if the channel is
    /// not (or no longer) connected.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let state = self.state.get();
        if state != ConnectionState::Connected {
            return Err(ChannelError::NotConnected(state));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send((envelope, ack_tx))
            .map_err(|_| ChannelError::Closed)?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChannelError::Io(e)),
            Err(_) => Err(ChannelError::Closed),
        }
    }

    /// Stop the channel task and tear down the socket. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task
            && let Err(e) = task.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "Control channel task panicked");
        }

        // Covers a task that never got past accept.
        self.state.advance(ConnectionState::Disconnecting);
        self.state.advance(ConnectionState::Disconnected);
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_channel(
    listener: TcpListener,
    state: Arc<StateCell>,
    handler: Arc<dyn FrameHandler>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
) {
    let stream = tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::debug!("Control channel closed before a worker connected");
            return;
        }
        accepted = listener.accept() => match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Worker connected to control channel");
                stream
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept worker connection");
                return;
            }
        },
    };
    // Exactly one connection per channel.
    drop(listener);

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY on control socket");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<Envelope>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<Envelope>::new());

    let handshake = tokio::select! {
        _ = shutdown.cancelled() => None,
        body = wait_for_handshake(&mut reader, handler.as_ref()) => body,
    };
    match handshake {
        Some(body) => {
            state.advance(ConnectionState::Connected);
            match WorkerInfo::from_body(&body) {
                Some(info) => tracing::info!(
                    pid = info.pid,
                    version = %info.testrelay,
                    engine = ?info.engine,
                    "Worker handshake received"
                ),
                None => tracing::info!(worker = %body, "Worker handshake received"),
            }
        }
        // No handshake: stay not ready. Only close() ends a channel that
        // never connected.
        None => return,
    }

    let mut abandoned = false;
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!("Control channel closing");
                break;
            }

            frame = reader.next() => {
                match frame {
                    Some(Ok(Ok(envelope))) => {
                        tracing::trace!(op = %envelope.op, kind = %envelope.kind, "Frame received");
                        handler.on_frame(envelope);
                    }
                    Some(Ok(Err(e))) => {
                        let error = ProtocolError::from(e);
                        tracing::warn!(error = %error, "Dropping control channel frame");
                        handler.on_protocol_error(&error);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Control channel read failed");
                        break;
                    }
                    None => {
                        tracing::info!("Worker closed control channel");
                        break;
                    }
                }
            }

            Some((envelope, ack)) = outbound_rx.recv() => {
                tracing::trace!(op = %envelope.op, kind = %envelope.kind, "Sending frame");
                // A peer that stops reading must not pin the task past close().
                let result = tokio::select! {
                    result = writer.send(envelope) => result,
                    _ = shutdown.cancelled() => {
                        abandoned = true;
                        Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "control channel closed during write",
                        ))
                    }
                };
                let failed = result.is_err();
                if let Err(ref e) = result {
                    tracing::warn!(error = %e, "Control channel write failed");
                }
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
        }
    }

    state.advance(ConnectionState::Disconnecting);
    drop(reader);
    if abandoned {
        // Flushing the half-written frame could block again; drop the socket.
        drop(writer);
    } else if let Err(e) = writer.close().await {
        tracing::debug!(error = %e, "Control socket shutdown failed");
    }
    state.advance(ConnectionState::Disconnected);
}

/// Read until the first well-formed handshake. `None` if the peer goes away first.
async fn wait_for_handshake(
    reader: &mut EnvelopeReader,
    handler: &dyn FrameHandler,
) -> Option<serde_json::Value> {
    loop {
        match reader.next().await {
            Some(Ok(Ok(envelope))) if envelope.kind == MessageKind::Handshake => {
                return Some(envelope.body);
            }
            Some(Ok(Ok(envelope))) => {
                let error = ProtocolError::UnexpectedBeforeHandshake(envelope.kind);
                tracing::warn!(error = %error, "Dropping control channel frame");
                handler.on_protocol_error(&error);
            }
            Some(Ok(Err(e))) => {
                let error = ProtocolError::from(e);
                tracing::warn!(error = %error, "Dropping control channel frame");
                handler.on_protocol_error(&error);
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Control channel failed before handshake");
                return None;
            }
            None => {
                tracing::warn!("Worker disconnected before handshake");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::OperationId;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    type Peer = Framed<TcpStream, JsonCodec<Envelope>>;

    #[derive(Default)]
    struct RecordingHandler {
        frames: StdMutex<Vec<Envelope>>,
        errors: StdMutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn frames(&self) -> Vec<Envelope> {
            self.frames.lock().unwrap().clone()
        }

        fn error_count(&self) -> usize {
            self.errors.lock().unwrap().len()
        }
    }

    impl FrameHandler for RecordingHandler {
        fn on_frame(&self, envelope: Envelope) {
            self.frames.lock().unwrap().push(envelope);
        }

        fn on_protocol_error(&self, error: &ProtocolError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    async fn start() -> (ControlChannel, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let channel = ControlChannel::start(None, Arc::clone(&handler) as Arc<dyn FrameHandler>)
            .await
            .unwrap();
        (channel, handler)
    }

    async fn connect(channel: &ControlChannel) -> Peer {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, channel.port()))
            .await
            .unwrap();
        Framed::new(stream, JsonCodec::new())
    }

    async fn handshake(channel: &ControlChannel) -> Peer {
        let mut peer = connect(channel).await;
        peer.send(Envelope::handshake(serde_json::json!({"pid": 1})))
            .await
            .unwrap();
        wait_until(|| channel.state() == ConnectionState::Connected).await;
        peer
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn readiness_matches_state_table() {
        for state in ConnectionState::ALL {
            let expected = matches!(
                state,
                ConnectionState::Connected
                    | ConnectionState::Disconnecting
                    | ConnectionState::Disconnected
            );
            assert_eq!(state.is_ready(), expected, "{state}");
        }
        assert!(!ConnectionState::Initialized.is_ready());
        assert!(!ConnectionState::Listening.is_ready());
    }

    #[test]
    fn states_are_totally_ordered() {
        for pair in ConnectionState::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn state_cell_only_moves_forward() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Initialized);

        assert!(cell.advance(ConnectionState::Listening));
        assert!(cell.advance(ConnectionState::Connected));
        assert!(!cell.advance(ConnectionState::Connected));
        assert!(cell.advance(ConnectionState::Disconnected));

        assert!(!cell.advance(ConnectionState::Connected));
        assert!(!cell.advance(ConnectionState::Disconnecting));
        assert_eq!(cell.get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn start_listens_on_ephemeral_port() {
        let (channel, _handler) = start().await;
        assert_eq!(channel.state(), ConnectionState::Listening);
        assert!(!channel.is_ready());
        assert_ne!(channel.port(), 0);
        channel.close().await;
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let (channel, _handler) = start().await;
        let err = channel
            .send(Envelope::find(OperationId::new(), serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(ConnectionState::Listening)));
        channel.close().await;
    }

    #[tokio::test]
    async fn connection_is_not_ready_until_handshake() {
        let (channel, handler) = start().await;
        let mut peer = connect(&channel).await;

        peer.send(Envelope::result(OperationId::new(), serde_json::json!({})))
            .await
            .unwrap();
        wait_until(|| handler.error_count() == 1).await;
        assert_eq!(channel.state(), ConnectionState::Listening);
        assert!(handler.frames().is_empty());

        peer.send(Envelope::handshake(serde_json::Value::Null))
            .await
            .unwrap();
        wait_until(|| channel.state() == ConnectionState::Connected).await;
        channel.close().await;
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (channel, handler) = start().await;
        let mut peer = handshake(&channel).await;

        let op = OperationId::new();
        channel
            .send(Envelope::find(op, serde_json::json!({"filter": "*"})))
            .await
            .unwrap();
        let received = peer.next().await.unwrap().unwrap().unwrap();
        assert_eq!(received.op, op);
        assert_eq!(received.kind, MessageKind::Find);

        peer.send(Envelope::result(op, serde_json::json!({"tests": 0})))
            .await
            .unwrap();
        wait_until(|| handler.frames().len() == 1).await;
        assert_eq!(handler.frames()[0].op, op);

        channel.close().await;
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_loop_continues() {
        let (channel, handler) = start().await;
        let mut peer = handshake(&channel).await;

        let garbage = b"definitely not json";
        let stream = peer.get_mut();
        stream.write_u32(garbage.len() as u32).await.unwrap();
        stream.write_all(garbage).await.unwrap();
        stream.flush().await.unwrap();

        let op = OperationId::new();
        peer.send(Envelope::complete(op, None)).await.unwrap();

        wait_until(|| handler.frames().len() == 1).await;
        assert_eq!(handler.error_count(), 1);
        assert_eq!(channel.state(), ConnectionState::Connected);

        channel.close().await;
    }

    #[tokio::test]
    async fn peer_disconnect_ends_in_disconnected() {
        let (channel, _handler) = start().await;
        let peer = handshake(&channel).await;
        drop(peer);

        wait_until(|| channel.state() == ConnectionState::Disconnected).await;
        // Still "ready": the handshake happened. The failure shows up at send time.
        assert!(channel.is_ready());
        let err = channel
            .send(Envelope::find(OperationId::new(), serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::NotConnected(ConnectionState::Disconnected)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_socket() {
        let (channel, _handler) = start().await;
        let mut peer = handshake(&channel).await;

        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        let next = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .unwrap();
        assert!(!matches!(next, Some(Ok(Ok(_)))));
    }

    #[tokio::test]
    async fn close_before_connect_is_terminal() {
        let (channel, _handler) = start().await;
        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, channel.port())).await.is_err());
    }

    #[tokio::test]
    async fn peer_leaving_before_handshake_stays_not_ready() {
        let (channel, handler) = start().await;
        let peer = connect(&channel).await;
        drop(peer);

        // Give the task time to see EOF.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.state(), ConnectionState::Listening);
        assert!(!channel.is_ready());
        assert_eq!(handler.error_count(), 0);

        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn close_interrupts_write_to_stalled_peer() {
        let (channel, _handler) = start().await;
        // Handshake done, then never read again.
        let _peer = handshake(&channel).await;

        let body = serde_json::Value::String("x".repeat(15 * 1024 * 1024));
        let send = channel.send(Envelope::find(OperationId::new(), body));
        let close = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            channel.close().await;
        };

        let (sent, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(send, close)
        })
        .await
        .expect("close hung on a stalled write");

        assert!(sent.is_err());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}
