//! Caller-supplied sink for non-fatal diagnostics.
//!
//! Protocol errors on the control channel and slow worker shutdown are
//! reported here instead of failing the caller.

use std::sync::Mutex as StdMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

impl DiagnosticLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Accepts free-text diagnostic messages.
pub trait DiagnosticSink: Send + Sync {
    fn message(&self, level: DiagnosticLevel, text: &str);

    fn warning(&self, text: &str) {
        self.message(DiagnosticLevel::Warning, text);
    }
}

/// Default sink: forwards to `tracing` under the `testrelay::diagnostics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn message(&self, level: DiagnosticLevel, text: &str) {
        match level {
            DiagnosticLevel::Info => tracing::info!(target: "testrelay::diagnostics", "{}", text),
            DiagnosticLevel::Warning => {
                tracing::warn!(target: "testrelay::diagnostics", "{}", text)
            }
            DiagnosticLevel::Error => {
                tracing::error!(target: "testrelay::diagnostics", "{}", text)
            }
        }
    }
}

/// Sink that keeps every message in memory, for hosts that render them later.
#[derive(Debug, Default)]
pub struct CollectingDiagnostics {
    messages: StdMutex<Vec<(DiagnosticLevel, String)>>,
}

impl CollectingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(DiagnosticLevel, String)> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, level: DiagnosticLevel) -> usize {
        self.messages()
            .iter()
            .filter(|(recorded, _)| *recorded == level)
            .count()
    }
}

impl DiagnosticSink for CollectingDiagnostics {
    fn message(&self, level: DiagnosticLevel, text: &str) {
        let mut guard = match self.messages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((level, text.to_string()));
    }
}
