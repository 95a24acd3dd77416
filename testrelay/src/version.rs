//! Version information carried in the worker handshake.

/// testrelay version from Cargo.toml
pub const TESTRELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Handshake body a worker sends when it connects.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorkerInfo {
    /// testrelay runtime version the worker was built against.
    pub testrelay: String,
    /// Worker process id.
    pub pid: u32,
    /// Name of the test engine behind the worker (if it reports one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

impl Default for WorkerInfo {
    fn default() -> Self {
        Self {
            testrelay: TESTRELAY_VERSION.to_string(),
            pid: std::process::id(),
            engine: None,
        }
    }
}

impl WorkerInfo {
    /// Info for the current process.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    pub fn to_body(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Read a handshake body. Unknown or partial bodies yield `None`.
    pub fn from_body(body: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(body.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_info_describes_current_process() {
        let info = WorkerInfo::new();
        assert_eq!(info.testrelay, TESTRELAY_VERSION);
        assert_eq!(info.pid, std::process::id());
        assert!(info.engine.is_none());
    }

    #[test]
    fn worker_info_serializes_minimal() {
        let info = WorkerInfo {
            testrelay: "0.1.0".to_string(),
            pid: 4242,
            engine: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "testrelay": "0.1.0",
          "pid": 4242
        }
        "#);
    }

    #[test]
    fn worker_info_serializes_full() {
        let info = WorkerInfo {
            testrelay: "0.1.0".to_string(),
            pid: 4242,
            engine: None,
        }
        .with_engine("stub");
        insta::assert_json_snapshot!(info, @r#"
        {
          "testrelay": "0.1.0",
          "pid": 4242,
          "engine": "stub"
        }
        "#);
    }

    #[test]
    fn from_body_round_trips_and_tolerates_junk() {
        let info = WorkerInfo::new().with_engine("stub");
        assert_eq!(WorkerInfo::from_body(&info.to_body()), Some(info));
        assert_eq!(WorkerInfo::from_body(&serde_json::json!({"pid": "x"})), None);
    }
}
