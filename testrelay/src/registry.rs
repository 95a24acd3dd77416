//! Operation registry - routes inbound envelopes to result sinks.
//!
//! One entry per in-flight `find`/`run` operation. The channel's read task
//! dispatches into the registry while callers register from their own tasks;
//! both go through a DashMap, and no map guard is held while a sink runs.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use crate::bridge::protocol::{Envelope, OperationId};
use crate::channel::{FrameHandler, ProtocolError};
use crate::diagnostics::DiagnosticSink;

/// What a sink wants after receiving an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Keep the registration; more results are expected.
    Continue,
    /// The operation is finished; drop the registration.
    Complete,
}

/// Receives the result stream of one operation.
///
/// Called from the channel's read task, so implementations must not block.
pub trait ResultSink: Send + Sync {
    fn deliver(&self, envelope: &Envelope) -> Delivery;
}

/// Sink backed by an unbounded tokio channel.
///
/// Completes on a `complete` envelope, or as soon as the receiver is gone.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx }
    }
}

impl ResultSink for ChannelSink {
    fn deliver(&self, envelope: &Envelope) -> Delivery {
        if self.tx.send(envelope.clone()).is_err() {
            return Delivery::Complete;
        }
        if envelope.is_complete() {
            Delivery::Complete
        } else {
            Delivery::Continue
        }
    }
}

/// Create a [`ChannelSink`] and the receiver its results arrive on.
pub fn sink_channel() -> (Arc<ChannelSink>, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink::new(tx)), rx)
}

pub struct OperationRegistry {
    sinks: DashMap<OperationId, Arc<dyn ResultSink>>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl OperationRegistry {
    pub fn new(diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            sinks: DashMap::new(),
            diagnostics,
        }
    }

    /// Register a sink for a fresh operation.
    ///
    /// # Panics
    ///
    /// If `id` is the broadcast id or is already registered. Ids are minted
    /// fresh per call, so either case is a bug in the caller.
    pub fn register(&self, id: OperationId, sink: Arc<dyn ResultSink>) {
        assert!(!id.is_broadcast(), "cannot register a sink under the broadcast id");
        match self.sinks.entry(id) {
            Entry::Occupied(_) => panic!("operation {id} is already registered"),
            Entry::Vacant(slot) => {
                slot.insert(sink);
            }
        }
        tracing::debug!(op = %id, "Registered operation");
    }

    pub fn remove(&self, id: &OperationId) -> bool {
        self.sinks.remove(id).is_some()
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.sinks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Drop every registration. Returns how many were still in flight.
    pub fn clear(&self) -> usize {
        let pending = self.sinks.len();
        self.sinks.clear();
        pending
    }

    /// Route one envelope to its sink, or to every sink for the broadcast id.
    ///
    /// Unknown ids are expected (late results after completion) and ignored.
    pub fn dispatch(&self, envelope: Envelope) {
        if envelope.op.is_broadcast() {
            self.broadcast(&envelope);
            return;
        }

        let op = envelope.op;
        let sink = self.sinks.get(&op).map(|entry| Arc::clone(entry.value()));
        let Some(sink) = sink else {
            tracing::trace!(%op, kind = %envelope.kind, "Dropping envelope for unknown operation");
            return;
        };

        if sink.deliver(&envelope) == Delivery::Complete {
            self.sinks.remove(&op);
            tracing::debug!(%op, "Operation complete");
        }
    }

    fn broadcast(&self, envelope: &Envelope) {
        let targets: Vec<(OperationId, Arc<dyn ResultSink>)> = self
            .sinks
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        tracing::trace!(kind = %envelope.kind, sinks = targets.len(), "Broadcasting envelope");
        for (op, sink) in targets {
            if sink.deliver(envelope) == Delivery::Complete {
                self.sinks.remove(&op);
                tracing::debug!(%op, "Operation complete (broadcast)");
            }
        }
    }
}

impl FrameHandler for OperationRegistry {
    fn on_frame(&self, envelope: Envelope) {
        self.dispatch(envelope);
    }

    fn on_protocol_error(&self, error: &ProtocolError) {
        self.diagnostics
            .warning(&format!("dropped control channel frame: {error}"));
    }
}
