//! Host side of remote execution: the RPC channel with its reader thread,
//! the heartbeat watchdog, and the remote run driver.
//!
//! Two logical tasks run in parallel on the host: the command path
//! (request/response correlation, this module's `call`) and the unsolicited
//! path (the reader thread continuously merging `event`/`metric`/`heartbeat`
//! frames into the local session). The session's per-file mutexes serialize
//! their appends.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map as JsonMap, Number, Value};

use osiris_core::events::{EventKind, MetricUnit};
use osiris_core::oml::StepMode;
use osiris_core::driver::CancelToken;
use osiris_io::run_index::RunStatus;

use crate::adapter::PreparedRun;
use crate::local::{emit_run_close, emit_step_failed, total_rows, StepOutcome, RunOutcome, TelemetrySink};
use crate::remote::protocol::{
    classify_worker_frame, read_frame, write_frame, Request, Response, WorkerFrame, CMD_CANCEL,
    CMD_EXEC_STEP, CMD_GET_ARTIFACT, CMD_PREPARE, CMD_SHUTDOWN, UNSOLICITED_EVENT,
    UNSOLICITED_HEARTBEAT, UNSOLICITED_METRIC,
};
use crate::remote::sandbox::{remove_scratch, scratch_dir, stage_package, SandboxLauncher};
use crate::session::Session;
use crate::{ExecError, RemoteError};

/// Remote-execution tuning. The worker's heartbeat cadence is its own
/// default (5s); the host only enforces the timeouts.
#[derive(Clone)]
pub struct RemoteConfig {
    /// Silence longer than this fails the in-flight command with
    /// `RemoteTimeout`.
    pub heartbeat_timeout: Duration,
    /// Hard bound on any single command (and therefore on each step).
    pub sandbox_timeout: Duration,
    pub launcher: Arc<dyn SandboxLauncher>,
}

impl RemoteConfig {
    pub fn new(launcher: Arc<dyn SandboxLauncher>) -> Self {
        RemoteConfig {
            heartbeat_timeout: Duration::from_secs(30),
            sandbox_timeout: Duration::from_secs(600),
            launcher,
        }
    }
}

/// The host end of the RPC channel.
pub struct ProxyChannel {
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Arc<Mutex<BTreeMap<u64, mpsc::Sender<Response>>>>,
    last_beat: Arc<Mutex<Instant>>,
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl ProxyChannel {
    /// Spawn the reader thread and hand back the command half.
    pub fn start(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        session: Arc<Session>,
    ) -> Arc<Self> {
        let channel = Arc::new(ProxyChannel {
            writer: Mutex::new(writer),
            pending: Arc::new(Mutex::new(BTreeMap::new())),
            last_beat: Arc::new(Mutex::new(Instant::now())),
            alive: Arc::new(AtomicBool::new(true)),
            next_id: AtomicU64::new(1),
        });

        let pending = Arc::clone(&channel.pending);
        let last_beat = Arc::clone(&channel.last_beat);
        let alive = Arc::clone(&channel.alive);
        std::thread::spawn(move || {
            let mut reader = reader;
            loop {
                match read_frame(&mut reader) {
                    Ok(Some(frame)) => match classify_worker_frame(frame) {
                        Ok(WorkerFrame::Response(response)) => {
                            let sender = pending.lock().expect("pending lock").remove(&response.id);
                            if let Some(tx) = sender {
                                let _ = tx.send(response);
                            } else {
                                tracing::warn!(id = response.id, "response for unknown request id");
                            }
                        }
                        Ok(WorkerFrame::Unsolicited { kind, payload }) => {
                            merge_unsolicited(&session, &last_beat, &kind, payload);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed worker frame");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "worker transport closed");
                        break;
                    }
                }
            }
            alive.store(false, Ordering::SeqCst);
        });

        channel
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn post(&self, kind: &str, payload: Value) -> Result<(u64, mpsc::Receiver<Response>), RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        let request = Request { id, kind: kind.to_owned(), payload };
        let frame = serde_json::to_value(&request)
            .map_err(|e| RemoteError::WorkerProtocol(format!("cannot serialize request: {e}")))?;
        let mut writer = self.writer.lock().expect("proxy writer lock");
        write_frame(&mut *writer, &frame).map_err(|e| {
            self.pending.lock().expect("pending lock").remove(&id);
            RemoteError::RemoteTransportLost(e.to_string())
        })?;
        Ok((id, rx))
    }

    /// Send a command and wait for its response, failing on transport loss,
    /// heartbeat silence, or the hard sandbox bound.
    pub fn call(&self, kind: &str, payload: Value, config: &RemoteConfig) -> Result<Value, RemoteError> {
        let (id, rx) = self.post(kind, payload)?;
        *self.last_beat.lock().expect("beat lock") = Instant::now();
        let started = Instant::now();

        loop {
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(response) => {
                    return if response.ok {
                        Ok(response.result.unwrap_or(Value::Null))
                    } else {
                        Err(RemoteError::WorkerFailure(
                            response.error.unwrap_or_else(|| "unspecified worker error".into()),
                        ))
                    };
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !self.is_alive() {
                        self.pending.lock().expect("pending lock").remove(&id);
                        return Err(RemoteError::RemoteTransportLost("worker stream closed".into()));
                    }
                    let silent = self.last_beat.lock().expect("beat lock").elapsed();
                    if silent > config.heartbeat_timeout {
                        self.pending.lock().expect("pending lock").remove(&id);
                        let _ = self.cancel(id);
                        return Err(RemoteError::RemoteTimeout(config.heartbeat_timeout));
                    }
                    if started.elapsed() > config.sandbox_timeout {
                        self.pending.lock().expect("pending lock").remove(&id);
                        let _ = self.cancel(id);
                        return Err(RemoteError::RemoteTimeout(config.sandbox_timeout));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(RemoteError::RemoteTransportLost("reader thread gone".into()));
                }
            }
        }
    }

    /// Fire-and-forget cancel of an in-flight command.
    pub fn cancel(&self, target_id: u64) -> Result<(), RemoteError> {
        let (_, _rx) = self.post(CMD_CANCEL, json!({"id": target_id}))?;
        Ok(())
    }

    /// Polite shutdown with a short deadline; callers tear the process down
    /// regardless of the outcome.
    pub fn shutdown(&self, config: &RemoteConfig) {
        let mut cfg = config.clone();
        cfg.sandbox_timeout = Duration::from_secs(2);
        cfg.heartbeat_timeout = Duration::from_secs(2);
        if let Err(e) = self.call(CMD_SHUTDOWN, Value::Null, &cfg) {
            tracing::debug!(error = %e, "worker shutdown handshake failed");
        }
    }
}

/// Merge one unsolicited worker frame into the local session: session-id
/// attribution and redaction reapplication only, no other transformation.
fn merge_unsolicited(
    session: &Arc<Session>,
    last_beat: &Arc<Mutex<Instant>>,
    kind: &str,
    payload: Value,
) {
    *last_beat.lock().expect("beat lock") = Instant::now();
    match kind {
        UNSOLICITED_HEARTBEAT => {}
        UNSOLICITED_EVENT => {
            let Some(mut body) = payload.as_object().cloned() else {
                tracing::warn!("event frame without object payload");
                return;
            };
            let ts = body
                .remove("ts")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(Session::now_iso);
            let Some(kind) = body
                .remove("event")
                .and_then(|v| serde_json::from_value::<EventKind>(v).ok())
            else {
                tracing::warn!("event frame without a known kind");
                return;
            };
            session.event_at(ts, kind, body);
        }
        UNSOLICITED_METRIC => {
            let Some(mut body) = payload.as_object().cloned() else {
                tracing::warn!("metric frame without object payload");
                return;
            };
            let ts = body
                .remove("ts")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(Session::now_iso);
            let name = body
                .remove("metric")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            let value = body
                .remove("value")
                .and_then(|v| v.as_number().cloned())
                .unwrap_or_else(|| Number::from(0));
            let unit = body
                .remove("unit")
                .and_then(|v| serde_json::from_value::<MetricUnit>(v).ok())
                .unwrap_or(MetricUnit::Code);
            let tags = body
                .remove("tags")
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default();
            session.metric_at(ts, &name, value, unit, tags);
        }
        other => tracing::warn!(kind = other, "unknown unsolicited kind"),
    }
}

/// Drive one prepared run through a sandbox. Mirrors `run_local`'s
/// observable behavior, plus the additive sandbox bootstrap events.
pub fn run_remote(
    prepared: &PreparedRun,
    session: &Arc<Session>,
    config: &RemoteConfig,
    cancel: &CancelToken,
) -> RunOutcome {
    let run_started = Instant::now();
    session.event(EventKind::SandboxBootstrapStart, JsonMap::new());

    let scratch = scratch_dir(session.run_id().as_str());
    let mut outcomes: Vec<StepOutcome> = Vec::new();
    let mut status = RunStatus::Completed;

    let bootstrap = stage_package(prepared, &scratch)
        .and_then(|()| config.launcher.launch(&scratch));
    match bootstrap {
        Err(e) => {
            let err = ExecError::Remote(e);
            session.set_fatal(err.kind(), &err.to_string());
            status = RunStatus::Failed;
            emit_run_close(session, status, 0, run_started.elapsed().as_millis() as u64);
            remove_scratch(&scratch);
            return RunOutcome { status, total_rows: 0, steps: outcomes };
        }
        Ok(mut handle) => {
            let reader = std::mem::replace(&mut handle.reader, Box::new(std::io::empty()));
            let writer = std::mem::replace(&mut handle.writer, Box::new(std::io::sink()));
            let channel = ProxyChannel::start(reader, writer, Arc::clone(session));

            match channel.call(CMD_PREPARE, json!({}), config) {
                Ok(_) => {
                    session.event(
                        EventKind::SandboxBootstrapComplete,
                        crate::local::obj(&[(
                            "duration_ms",
                            json!(run_started.elapsed().as_millis() as u64),
                        )]),
                    );
                    status = drive_steps(prepared, session, &channel, config, cancel, &mut outcomes);
                }
                Err(e) => {
                    let err = ExecError::Remote(e);
                    session.set_fatal(err.kind(), &err.to_string());
                    status = RunStatus::Failed;
                }
            }

            let totals = total_rows(&outcomes);
            emit_run_close(session, status, totals, run_started.elapsed().as_millis() as u64);

            // Teardown always: polite handshake, then the axe, then scratch
            // removal (the resolved-connection snapshot lives there).
            channel.shutdown(config);
            handle.teardown();
            remove_scratch(&scratch);
            return RunOutcome { status, total_rows: totals, steps: outcomes };
        }
    }
}

fn drive_steps(
    prepared: &PreparedRun,
    session: &Arc<Session>,
    channel: &Arc<ProxyChannel>,
    config: &RemoteConfig,
    cancel: &CancelToken,
    outcomes: &mut Vec<StepOutcome>,
) -> RunStatus {
    for step in &prepared.manifest.steps {
        if cancel.is_cancelled() {
            session.event(EventKind::CancelRequested, JsonMap::new());
            session.set_fatal("cancelled", "cancellation requested");
            return RunStatus::Cancelled;
        }

        match channel.call(CMD_EXEC_STEP, json!({"step_id": step.id}), config) {
            Ok(result) => {
                let rows = result.get("rows_processed").and_then(Value::as_u64).unwrap_or(0);
                let duration_ms = result.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);
                let mode = result
                    .get("mode")
                    .and_then(|v| serde_json::from_value::<StepMode>(v.clone()).ok())
                    .unwrap_or(step.mode);

                if let Err(e) = fetch_artifacts(session, channel, config, &step.id, &result) {
                    let err = ExecError::Remote(e);
                    session.set_fatal(err.kind(), &err.to_string());
                    emit_step_failed(session.as_ref() as &dyn TelemetrySink, &step.id, &err);
                    return RunStatus::Failed;
                }
                outcomes.push(StepOutcome { step_id: step.id.clone(), mode, rows, duration_ms });
            }
            Err(RemoteError::WorkerFailure(msg)) => {
                // The worker already streamed step_failed for driver errors;
                // only the fatal slot and status are host-side state.
                session.set_fatal("driver_failure", &msg);
                return RunStatus::Failed;
            }
            Err(e) => {
                let err = ExecError::Remote(e);
                session.set_fatal(err.kind(), &err.to_string());
                emit_step_failed(session.as_ref() as &dyn TelemetrySink, &step.id, &err);
                return RunStatus::Failed;
            }
        }
    }
    RunStatus::Completed
}

/// Pull the step's artifacts into the host session tree so the artifact
/// layout is byte-identical to a local run.
fn fetch_artifacts(
    session: &Arc<Session>,
    channel: &Arc<ProxyChannel>,
    config: &RemoteConfig,
    step_id: &str,
    exec_result: &Value,
) -> Result<(), RemoteError> {
    let names: Vec<String> = exec_result
        .get("artifacts")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
        .unwrap_or_default();

    for logical in names {
        let result = channel.call(
            CMD_GET_ARTIFACT,
            json!({"step_id": step_id, "logical_name": logical}),
            config,
        )?;
        let data_hex = result
            .get("data_hex")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::WorkerProtocol("get_artifact without data_hex".into()))?;
        let bytes = hex::decode(data_hex)
            .map_err(|e| RemoteError::WorkerProtocol(format!("bad artifact hex: {e}")))?;

        let path = session
            .artifacts_root()
            .as_std_path()
            .join(step_id)
            .join(&logical);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RemoteError::WorkerProtocol(format!("cannot create artifact dir: {e}")))?;
        }
        std::fs::write(&path, bytes)
            .map_err(|e| RemoteError::WorkerProtocol(format!("cannot write artifact: {e}")))?;
    }
    Ok(())
}
