//! crates/osiris_core/src/driver.rs
//! The driver contract: the single seam between the engine and connector
//! implementations. Drivers are registered explicitly at process startup;
//! there is no reflection and no global registry object.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map as JsonMap, Number, Value};

use crate::events::{EventKind, MetricUnit};
use crate::ids::StepId;
use crate::table::{StepInputs, StepOutputs};

/// Cooperative cancellation signal. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execution-time services exposed to a driver. Implemented by the session
/// layer; drivers never see files or writers directly.
pub trait RunContext: Send + Sync {
    /// Append a structured event to the session's event stream.
    fn log_event(&self, kind: EventKind, payload: JsonMap<String, Value>);

    /// Append a metric observation to the session's metric stream.
    fn log_metric(&self, name: &str, value: Number, unit: MetricUnit, tags: JsonMap<String, Value>);

    /// Absolute path for a named artifact of the current step. The parent
    /// directory exists on return.
    fn artifact_path(&self, logical_name: &str) -> Result<PathBuf, DriverError>;

    /// True once cancellation was requested. Drivers may finish the batch in
    /// flight but must not start new work afterwards.
    fn is_cancelled(&self) -> bool;
}

/// Everything a driver invocation receives. Field access replaces positional
/// coupling; extractors see an empty `inputs`.
pub struct DriverRequest<'a> {
    pub step_id: &'a StepId,
    pub config: &'a JsonMap<String, Value>,
    pub inputs: &'a StepInputs,
    pub ctx: &'a dyn RunContext,
}

/// Driver failure surface. The runtime maps these to `step_failed` events.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("missing input '{0}'")]
    MissingInput(String),
    #[error("i/o: {0}")]
    Io(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Io(e.to_string())
    }
}

impl DriverError {
    /// Stable error type token recorded in `step_failed.error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            DriverError::Config(_) => "config",
            DriverError::MissingInput(_) => "missing_input",
            DriverError::Io(_) => "io",
            DriverError::Cancelled => "cancelled",
            DriverError::Failed(_) => "driver_failure",
        }
    }
}

/// The driver contract. `run` must emit the mode-appropriate row metric
/// (`rows_read` / `rows_written` / `rows_processed`) tagged with the step id
/// after the operation completes; writers return an empty output map.
pub trait Driver: Send + Sync {
    fn run(&self, req: DriverRequest<'_>) -> Result<StepOutputs, DriverError>;
}

/// Process-wide driver registry: component driver key → implementation.
/// Populated once at startup, immutable afterwards (callers hold it behind
/// `Arc`). A missing driver at execute time is a fatal, typed error at the
/// call site, not here.
#[derive(Default)]
pub struct DriverRegistry {
    map: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        DriverRegistry::default()
    }

    /// Register a driver under `name`. Duplicate names are refused; drivers
    /// are wired exactly once at startup.
    pub fn register(&mut self, name: &str, driver: Arc<dyn Driver>) -> Result<(), DuplicateDriver> {
        if self.map.contains_key(name) {
            return Err(DuplicateDriver(name.to_owned()));
        }
        self.map.insert(name.to_owned(), driver);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.map.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.map.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("driver already registered: {0}")]
pub struct DuplicateDriver(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDriver;
    impl Driver for NoopDriver {
        fn run(&self, _req: DriverRequest<'_>) -> Result<StepOutputs, DriverError> {
            Ok(StepOutputs::new())
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut reg = DriverRegistry::new();
        reg.register("memory.extractor", Arc::new(NoopDriver)).unwrap();
        assert!(reg.contains("memory.extractor"));
        assert!(reg.get("csv.writer").is_none());
        assert_eq!(reg.names(), vec!["memory.extractor"]);

        let dup = reg.register("memory.extractor", Arc::new(NoopDriver));
        assert_eq!(dup.unwrap_err(), DuplicateDriver("memory.extractor".into()));
    }

    #[test]
    fn cancel_token_shares_state() {
        let t = CancelToken::new();
        let t2 = t.clone();
        assert!(!t2.is_cancelled());
        t.cancel();
        assert!(t2.is_cancelled());
    }
}
