//! Wire protocol types for controller-worker communication.
//!
//! Every frame on the control channel is an [`Envelope`]: the operation it
//! belongs to, a message kind, and an opaque JSON body. The controller only
//! ever emits `find` and `run`; everything else flows worker → controller.

use serde::{Deserialize, Serialize};

/// Correlation token for one `find`/`run` operation and its result stream.
///
/// UUID v4 so that ids minted by concurrent callers never collide. The nil
/// UUID is reserved as [`OperationId::BROADCAST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(uuid::Uuid);

impl OperationId {
    /// Delivered to every registered sink instead of a single one.
    pub const BROADCAST: OperationId = OperationId(uuid::Uuid::nil());

    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Kind tag of an envelope.
///
/// Kinds the core does not know about are carried through as [`MessageKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// First frame a worker sends after connecting.
    Handshake,
    /// Discovery only.
    Find,
    /// Discovery plus execution.
    Run,
    /// One discovery or execution record.
    Result,
    /// Free-text out-of-band message, usually broadcast.
    Diagnostic,
    /// Last frame of an operation's result stream.
    Complete,
    #[serde(untagged)]
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Handshake => "handshake",
            Self::Find => "find",
            Self::Run => "run",
            Self::Result => "result",
            Self::Diagnostic => "diagnostic",
            Self::Complete => "complete",
            Self::Other(kind) => kind,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub op: OperationId,
    pub kind: MessageKind,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn new(op: OperationId, kind: MessageKind, body: serde_json::Value) -> Self {
        Self { op, kind, body }
    }

    pub fn handshake(body: serde_json::Value) -> Self {
        Self::new(OperationId::BROADCAST, MessageKind::Handshake, body)
    }

    pub fn find(op: OperationId, settings: serde_json::Value) -> Self {
        Self::new(op, MessageKind::Find, settings)
    }

    pub fn run(op: OperationId, settings: serde_json::Value) -> Self {
        Self::new(op, MessageKind::Run, settings)
    }

    pub fn result(op: OperationId, record: serde_json::Value) -> Self {
        Self::new(op, MessageKind::Result, record)
    }

    pub fn diagnostic(op: OperationId, message: impl Into<String>) -> Self {
        Self::new(
            op,
            MessageKind::Diagnostic,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Completion frame; `error` is set when the engine failed the operation.
    pub fn complete(op: OperationId, error: Option<String>) -> Self {
        let body = match error {
            Some(error) => serde_json::json!({ "error": error }),
            None => serde_json::Value::Null,
        };
        Self::new(op, MessageKind::Complete, body)
    }

    pub fn is_complete(&self) -> bool {
        self.kind == MessageKind::Complete
    }
}
