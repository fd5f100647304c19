//! Sequential DAG execution.
//!
//! `execute_one_step` is the single step executor: the local runner drives
//! it against the session, and the remote worker drives the very same code
//! against a frame-forwarding sink: that shared path is what makes
//! local/remote event parity structural rather than aspirational.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map as JsonMap, Number, Value};

use osiris_core::driver::{CancelToken, Driver, DriverError, DriverRequest, DriverRegistry, RunContext};
use osiris_core::events::{EventKind, MetricUnit};
use osiris_core::ids::StepId;
use osiris_core::oml::StepMode;
use osiris_core::table::{StepInputs, StepOutputs};
use osiris_compiler::manifest::ManifestStep;
use osiris_io::connections::ResolvedConnection;
use osiris_io::run_index::RunStatus;

use crate::session::Session;
use crate::ExecError;

/// Where step-level telemetry goes. The session locally; the RPC stream in
/// the sandbox worker.
pub trait TelemetrySink: Send + Sync {
    fn event(&self, kind: EventKind, payload: JsonMap<String, Value>);
    fn metric(&self, name: &str, value: Number, unit: MetricUnit, tags: JsonMap<String, Value>);
    fn artifact_path(&self, step_id: &StepId, logical_name: &str) -> Result<PathBuf, DriverError>;
}

impl TelemetrySink for Session {
    fn event(&self, kind: EventKind, payload: JsonMap<String, Value>) {
        Session::event(self, kind, payload);
    }

    fn metric(&self, name: &str, value: Number, unit: MetricUnit, tags: JsonMap<String, Value>) {
        Session::metric(self, name, value, unit, tags);
    }

    fn artifact_path(&self, step_id: &StepId, logical_name: &str) -> Result<PathBuf, DriverError> {
        let path = self
            .artifacts_root()
            .as_std_path()
            .join(step_id.as_str())
            .join(logical_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }
}

/// Driver-facing context bound to one step of one sink.
struct SinkStepContext {
    sink: Arc<dyn TelemetrySink>,
    step_id: StepId,
    cancel: CancelToken,
}

impl RunContext for SinkStepContext {
    fn log_event(&self, kind: EventKind, payload: JsonMap<String, Value>) {
        self.sink.event(kind, payload);
    }

    fn log_metric(&self, name: &str, value: Number, unit: MetricUnit, tags: JsonMap<String, Value>) {
        self.sink.metric(name, value, unit, tags);
    }

    fn artifact_path(&self, logical_name: &str) -> Result<PathBuf, DriverError> {
        self.sink.artifact_path(&self.step_id, logical_name)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Per-step result used for row accounting.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: String,
    pub mode: StepMode,
    pub rows: u64,
    pub duration_ms: u64,
}

/// Whole-run result handed to `collect`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub total_rows: u64,
    pub steps: Vec<StepOutcome>,
}

/// Execute one manifest step: events, connection echo, driver invocation,
/// output caching, the step's row accounting.
#[allow(clippy::too_many_arguments)]
pub fn execute_one_step(
    sink: &Arc<dyn TelemetrySink>,
    drivers: &DriverRegistry,
    step: &ManifestStep,
    config: &JsonMap<String, Value>,
    resolved: Option<&ResolvedConnection>,
    cache: &mut BTreeMap<String, StepOutputs>,
    cancel: &CancelToken,
) -> Result<StepOutcome, ExecError> {
    let step_id: StepId = step
        .id
        .parse()
        .map_err(|e| ExecError::Manifest(format!("bad step id in manifest: {e}")))?;

    sink.event(
        EventKind::StepStart,
        obj(&[("step_id", json!(step.id)), ("driver", json!(step.driver))]),
    );

    let driver: Arc<dyn Driver> = drivers
        .get(&step.driver)
        .ok_or_else(|| ExecError::UnknownDriver(step.driver.clone()))?;

    // Connection echo: resolution itself happened at prepare; the events keep
    // the observable shape identical across adapters.
    if let Some(conn_ref) = &step.connection {
        sink.event(
            EventKind::ConnectionResolveStart,
            obj(&[("step_id", json!(step.id)), ("connection", json!(conn_ref))]),
        );
        sink.event(
            EventKind::ConnectionResolveComplete,
            obj(&[("step_id", json!(step.id)), ("connection", json!(conn_ref))]),
        );
    }

    // Driver config: canonical config minus the symbolic reference, plus the
    // resolved mapping under the one key drivers may read credentials from.
    let mut driver_config = config.clone();
    driver_config.remove("connection");
    if let Some(conn) = resolved {
        driver_config.insert("resolved_connection".into(), Value::Object(conn.fields.clone()));
    }

    // Inputs come from the in-memory cache of upstream outputs.
    let mut inputs = StepInputs::new();
    for (name, reference) in &step.inputs {
        let (upstream, output) = osiris_core::oml::parse_input_ref(reference)
            .ok_or_else(|| ExecError::Manifest(format!("bad input reference: {reference}")))?;
        let table = cache
            .get(upstream)
            .and_then(|outputs| outputs.get(output))
            .cloned()
            .ok_or_else(|| ExecError::MissingUpstreamOutput {
                upstream: upstream.to_owned(),
                output: output.to_owned(),
            })?;
        inputs.insert(name.clone(), table);
    }

    let ctx = SinkStepContext {
        sink: Arc::clone(sink),
        step_id: step_id.clone(),
        cancel: cancel.clone(),
    };

    let started = Instant::now();
    let result = driver.run(DriverRequest {
        step_id: &step_id,
        config: &driver_config,
        inputs: &inputs,
        ctx: &ctx,
    });
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(outputs) => {
            let out_rows: u64 = outputs.values().map(|t| t.len() as u64).sum();
            let in_rows: u64 = inputs.values().map(|t| t.len() as u64).sum();
            let rows = if outputs.is_empty() { in_rows } else { out_rows };
            cache.insert(step.id.clone(), outputs);

            sink.event(
                EventKind::StepComplete,
                obj(&[
                    ("step_id", json!(step.id)),
                    ("rows_processed", json!(rows)),
                    ("duration_ms", json!(duration_ms)),
                ]),
            );
            Ok(StepOutcome { step_id: step.id.clone(), mode: step.mode, rows, duration_ms })
        }
        Err(e) => {
            let err = ExecError::DriverFailure { step: step.id.clone(), source: e };
            emit_step_failed(sink.as_ref(), &step.id, &err);
            Err(err)
        }
    }
}

/// Emit `step_failed` for any execution error (redaction happens in the
/// sink; the payload itself never carries secrets beyond the message text).
pub fn emit_step_failed(sink: &dyn TelemetrySink, step_id: &str, err: &ExecError) {
    let error_type = match err {
        ExecError::DriverFailure { source, .. } => source.error_type(),
        other => other.kind(),
    };
    sink.event(
        EventKind::StepFailed,
        obj(&[
            ("step_id", json!(step_id)),
            ("error", json!(err.to_string())),
            ("error_type", json!(error_type)),
        ]),
    );
}

/// Run every step of a prepared manifest sequentially (fail-fast) against
/// the local session, then emit the run-closing events.
pub fn run_local(
    prepared: &crate::adapter::PreparedRun,
    drivers: &DriverRegistry,
    session: &Arc<Session>,
    cancel: &CancelToken,
) -> RunOutcome {
    let sink: Arc<dyn TelemetrySink> = Arc::clone(session) as Arc<dyn TelemetrySink>;
    let started = Instant::now();
    let mut cache: BTreeMap<String, StepOutputs> = BTreeMap::new();
    let mut outcomes: Vec<StepOutcome> = Vec::new();
    let mut status = RunStatus::Completed;

    for step in &prepared.manifest.steps {
        if cancel.is_cancelled() {
            session.event(EventKind::CancelRequested, JsonMap::new());
            session.set_fatal("cancelled", "cancellation requested");
            status = RunStatus::Cancelled;
            break;
        }
        let config = prepared.step_configs.get(&step.id).cloned().unwrap_or_default();
        let resolved = prepared.connections.get(&step.id);
        match execute_one_step(&sink, drivers, step, &config, resolved, &mut cache, cancel) {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                session.set_fatal(err.kind(), &err.to_string());
                status = if matches!(err, ExecError::Cancelled) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                break;
            }
        }
    }

    let total_rows = total_rows(&outcomes);
    emit_run_close(session, status, total_rows, started.elapsed().as_millis() as u64);
    RunOutcome { status, total_rows, steps: outcomes }
}

/// The run-closing event pair, shared by the local runner and the remote
/// proxy so both adapters close a session with identical event kinds.
pub fn emit_run_close(session: &Session, status: RunStatus, total_rows: u64, duration_ms: u64) {
    session.event(
        EventKind::CleanupComplete,
        obj(&[("total_rows", json!(total_rows)), ("duration_ms", json!(duration_ms))]),
    );
    session.event(EventKind::RunEnd, obj(&[("status", json!(status.as_str()))]));
}

/// The single source of truth for aggregate row counts: writer rows when any
/// writer ran, extractor rows otherwise (avoids double-counting).
pub fn total_rows(outcomes: &[StepOutcome]) -> u64 {
    let writer_rows: u64 = outcomes
        .iter()
        .filter(|o| o.mode == StepMode::Write)
        .map(|o| o.rows)
        .sum();
    let any_writer = outcomes.iter().any(|o| o.mode == StepMode::Write);
    if any_writer {
        writer_rows
    } else {
        outcomes
            .iter()
            .filter(|o| o.mode == StepMode::Read)
            .map(|o| o.rows)
            .sum()
    }
}

pub(crate) fn obj(fields: &[(&str, Value)]) -> JsonMap<String, Value> {
    let mut m = JsonMap::new();
    for (k, v) in fields {
        m.insert((*k).to_string(), v.clone());
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(mode: StepMode, rows: u64) -> StepOutcome {
        StepOutcome { step_id: "s".into(), mode, rows, duration_ms: 1 }
    }

    #[test]
    fn writer_rows_win_over_extractor_rows() {
        let outcomes = vec![outcome(StepMode::Read, 10), outcome(StepMode::Write, 7)];
        assert_eq!(total_rows(&outcomes), 7);
    }

    #[test]
    fn extractor_rows_used_when_no_writer_ran() {
        let outcomes = vec![outcome(StepMode::Read, 10), outcome(StepMode::Transform, 9)];
        assert_eq!(total_rows(&outcomes), 10);
    }

    #[test]
    fn empty_run_is_zero() {
        assert_eq!(total_rows(&[]), 0);
    }
}
