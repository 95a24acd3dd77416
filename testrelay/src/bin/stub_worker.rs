//! Stub worker executable.
//!
//! Speaks the control-channel protocol with a trivial engine that "discovers"
//! a configurable number of tests. Behavior is selected through environment:
//!
//! - `TESTRELAY_STUB_MODE`: `normal` (default), `silent` (never connects) or
//!   `stubborn` (keeps running after the controller closes)
//! - `TESTRELAY_STUB_LINGER_MS`: how long `silent`/`stubborn` stay alive
//! - `TESTRELAY_STUB_TESTS`: number of tests to report

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use testrelay::identity::{IdentityScope, TestMember, test_identifier};
use testrelay::worker::{EngineError, ResultWriter, TestEngine, WorkerConfig, run_worker};

const DEFAULT_LINGER_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StubMode {
    Normal,
    Silent,
    Stubborn,
}

impl StubMode {
    fn from_env() -> Self {
        match std::env::var("TESTRELAY_STUB_MODE").as_deref() {
            Ok("silent") => Self::Silent,
            Ok("stubborn") => Self::Stubborn,
            _ => Self::Normal,
        }
    }
}

fn env_number(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("TESTRELAY_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "testrelay={level},testrelay_stub_worker={level},testrelay::bridge=off",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Reports `tests` tests on `Stub.Tests`; every run passes unless the
/// settings carry a `fail_with` message.
struct StubEngine {
    tests: u64,
}

impl StubEngine {
    fn names(&self) -> Vec<String> {
        let mut scope = IdentityScope::new();
        (0..self.tests)
            .map(|i| {
                let member = TestMember::method("Stub.Tests", format!("case_{}", i / 2));
                test_identifier(&member, &[serde_json::json!(i % 2)], &mut scope)
            })
            .collect()
    }

    fn report(&self, writer: &ResultWriter, state: &str) -> Result<(), EngineError> {
        for name in self.names() {
            writer
                .send_result(serde_json::json!({ "test": name, "state": state }))
                .map_err(|e| EngineError::execution(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TestEngine for StubEngine {
    async fn find(
        &self,
        _settings: serde_json::Value,
        writer: ResultWriter,
    ) -> Result<(), EngineError> {
        self.report(&writer, "discovered")
    }

    async fn run(
        &self,
        settings: serde_json::Value,
        writer: ResultWriter,
    ) -> Result<(), EngineError> {
        if let Some(reason) = settings.get("fail_with").and_then(|v| v.as_str()) {
            return Err(EngineError::execution(reason));
        }
        self.report(&writer, "passed")
    }

    fn name(&self) -> Option<String> {
        Some("stub".to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = WorkerConfig::from_args(std::env::args().skip(1))
        .context("invalid worker arguments")?;
    let mode = StubMode::from_env();
    let linger = Duration::from_millis(env_number("TESTRELAY_STUB_LINGER_MS", DEFAULT_LINGER_MS));
    let engine = Arc::new(StubEngine {
        tests: env_number("TESTRELAY_STUB_TESTS", 0),
    });
    tracing::info!(?mode, port = config.port.get(), "Stub worker starting");

    if mode == StubMode::Silent {
        tokio::time::sleep(linger).await;
        return Ok(());
    }

    run_worker(engine, config)
        .await
        .context("control channel failed")?;

    if mode == StubMode::Stubborn {
        tracing::info!(linger_ms = linger.as_millis() as u64, "Ignoring shutdown");
        tokio::time::sleep(linger).await;
    }
    Ok(())
}
