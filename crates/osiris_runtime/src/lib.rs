//! crates/osiris_runtime/src/lib.rs
//! Run-time half of the engine.
//!
//! - `session`: the per-run scope (JSONL telemetry, artifacts, redaction)
//! - `local`: sequential DAG execution against the driver registry
//! - `adapter`: the polymorphic prepare → execute → collect lifecycle
//! - `remote`: the transparent proxy (host) and worker (sandbox) halves of
//!   remote execution, plus the framed RPC protocol between them
//!
//! The parity rule everything here serves: a manifest executed remotely must
//! be indistinguishable at the observation layer (events, metrics,
//! artifacts, run records) from the same manifest executed locally, wall
//! clock and sandbox bootstrap events aside.

#![forbid(unsafe_code)]

use thiserror::Error;

pub mod adapter;
pub mod local;
pub mod remote;
pub mod session;

pub use adapter::{CollectedRun, ExecutionAdapter, ExecutionContext, ExecutionResult, PreparedRun};
pub use session::Session;

/// Remote-execution failure surface.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("sandbox create failed: {0}")]
    SandboxCreateFailed(String),
    #[error("remote timeout: no heartbeat or completion within {0:?}")]
    RemoteTimeout(std::time::Duration),
    #[error("remote transport lost: {0}")]
    RemoteTransportLost(String),
    #[error("worker protocol error: {0}")]
    WorkerProtocol(String),
    #[error("worker reported: {0}")]
    WorkerFailure(String),
}

/// Execution failure surface. `collect` still runs on every one of these;
/// they decide the run record's status, not whether it is written.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unknown driver: {0}")]
    UnknownDriver(String),
    #[error("step {step} failed: {source}")]
    DriverFailure {
        step: String,
        #[source]
        source: osiris_core::driver::DriverError,
    },
    #[error("missing upstream output '{output}' of step {upstream}")]
    MissingUpstreamOutput { upstream: String, output: String },
    #[error(transparent)]
    Connection(#[from] osiris_io::connections::ConnectionError),
    #[error(transparent)]
    Io(#[from] osiris_io::IoError),
    #[error("i/o: {0}")]
    StdIo(String),
    #[error(transparent)]
    Index(#[from] osiris_io::run_index::IndexError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("manifest: {0}")]
    Manifest(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::StdIo(e.to_string())
    }
}

impl ExecError {
    /// Stable kind token for `step_failed.error_type` / fatal-error capture.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::UnknownDriver(_) => "unknown_driver",
            ExecError::DriverFailure { .. } => "driver_failure",
            ExecError::MissingUpstreamOutput { .. } => "missing_upstream_output",
            ExecError::Connection(_) => "connection",
            ExecError::Io(_) | ExecError::StdIo(_) => "io",
            ExecError::Index(_) => "index",
            ExecError::Remote(RemoteError::RemoteTimeout(_)) => "remote_timeout",
            ExecError::Remote(RemoteError::RemoteTransportLost(_)) => "remote_transport_lost",
            ExecError::Remote(RemoteError::SandboxCreateFailed(_)) => "sandbox_create_failed",
            ExecError::Remote(_) => "remote",
            ExecError::Manifest(_) => "manifest",
            ExecError::Cancelled => "cancelled",
        }
    }
}
