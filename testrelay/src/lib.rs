//! testrelay: drives an out-of-process test engine over a private TCP channel.

mod version;

pub mod bridge;
pub mod channel;
pub mod controller;
pub mod diagnostics;
pub mod identity;
pub mod launcher;
pub mod registry;
pub mod teardown;
pub mod worker;

pub use bridge::protocol::{Envelope, MessageKind, OperationId};
pub use channel::{ChannelError, ConnectionState, ControlChannel};
pub use controller::{ControllerConfig, ControllerError, RemoteEngineController};
pub use diagnostics::{
    CollectingDiagnostics, DiagnosticLevel, DiagnosticSink, TracingDiagnostics,
};
pub use launcher::{ConfigError, ControlPort, ExecutableSpawner, SpawnError, WorkerSpawner};
pub use registry::{ChannelSink, Delivery, OperationRegistry, ResultSink, sink_channel};
pub use version::{TESTRELAY_VERSION, WorkerInfo};
pub use worker::{EngineError, ResultWriter, TestEngine, WorkerConfig, run_worker};
