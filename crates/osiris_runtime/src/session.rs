//! The session: the execution-time scope of one run.
//!
//! Owns the append-only `events.jsonl` / `metrics.jsonl` writers (one mutex
//! per file), the artifacts tree, a fatal-error slot, and the run's
//! `Redactor`. Every line on every output path is redacted before it is
//! written; there is no unredacted emission path.
//!
//! Sessions are never shared between concurrent runs; one run mints one
//! session id and the run record reuses it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde_json::{Map as JsonMap, Number, Value};

use osiris_core::driver::{CancelToken, DriverError, RunContext};
use osiris_core::events::{EventKind, EventRecord, MetricRecord, MetricUnit};
use osiris_core::ids::{RunId, StepId};
use osiris_core::redact::Redactor;
use osiris_io::fs_contract::FilesystemContract;

use crate::ExecError;

/// Mint a run id from the current wall clock and a fresh nonce.
pub fn mint_run_id() -> RunId {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    RunId::assemble(&ts, &uuid[..6]).expect("minted id is well-formed")
}

/// Captured fatal error (at most one per session; the first wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub kind: String,
    pub message: String,
}

pub struct Session {
    run_id: RunId,
    redactor: Redactor,
    events: Mutex<File>,
    metrics: Mutex<File>,
    events_path: Utf8PathBuf,
    metrics_path: Utf8PathBuf,
    artifacts_root: Utf8PathBuf,
    fatal: Mutex<Option<FatalError>>,
}

impl Session {
    /// Create the session directory tree and open the telemetry writers.
    pub fn create(fsc: &FilesystemContract, run_id: RunId, redactor: Redactor) -> Result<Arc<Self>, ExecError> {
        let dir = fsc.session_dir(&run_id);
        let artifacts_root = fsc.artifacts_dir(&run_id);
        std::fs::create_dir_all(artifacts_root.as_std_path())?;

        let events_path = fsc.events_path(&run_id);
        let metrics_path = fsc.metrics_path(&run_id);
        let events = open_append(&events_path)?;
        let metrics = open_append(&metrics_path)?;

        tracing::debug!(session = %run_id, dir = %dir, "session created");
        Ok(Arc::new(Session {
            run_id,
            redactor,
            events: Mutex::new(events),
            metrics: Mutex::new(metrics),
            events_path,
            metrics_path,
            artifacts_root,
            fatal: Mutex::new(None),
        }))
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn events_path(&self) -> &Utf8PathBuf {
        &self.events_path
    }

    pub fn metrics_path(&self) -> &Utf8PathBuf {
        &self.metrics_path
    }

    pub fn artifacts_root(&self) -> &Utf8PathBuf {
        &self.artifacts_root
    }

    /// Millisecond-precision RFC 3339 UTC timestamp.
    pub fn now_iso() -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// Emit an event stamped with the current time.
    pub fn event(&self, kind: EventKind, payload: JsonMap<String, Value>) {
        self.event_at(Self::now_iso(), kind, payload);
    }

    /// Emit an event with a caller-supplied timestamp (the remote merge path
    /// keeps the worker's clock; everything else is attributed here).
    pub fn event_at(&self, ts: String, kind: EventKind, payload: JsonMap<String, Value>) {
        let record = EventRecord {
            ts,
            session: self.run_id.to_string(),
            event: kind,
            payload: self.redactor.redact_map(&payload),
        };
        debug_assert!(record.payload_complete(), "incomplete payload for {}", kind.as_str());
        tracing::info!(target: "osiris::events", session = %self.run_id, event = kind.as_str());
        self.append_line(&self.events, &record);
    }

    /// Emit a metric stamped with the current time.
    pub fn metric(&self, name: &str, value: Number, unit: MetricUnit, tags: JsonMap<String, Value>) {
        self.metric_at(Self::now_iso(), name, value, unit, tags);
    }

    pub fn metric_at(
        &self,
        ts: String,
        name: &str,
        value: Number,
        unit: MetricUnit,
        tags: JsonMap<String, Value>,
    ) {
        let record = MetricRecord {
            ts,
            session: self.run_id.to_string(),
            metric: name.to_owned(),
            value,
            unit,
            tags: self.redactor.redact_map(&tags),
        };
        self.append_line(&self.metrics, &record);
    }

    /// Record the first fatal error of the run (later ones are kept only in
    /// the event stream).
    pub fn set_fatal(&self, kind: &str, message: &str) {
        let mut slot = self.fatal.lock().expect("fatal lock");
        if slot.is_none() {
            *slot = Some(FatalError {
                kind: kind.to_owned(),
                message: self.redactor.scrub_str(message),
            });
        }
    }

    pub fn fatal(&self) -> Option<FatalError> {
        self.fatal.lock().expect("fatal lock").clone()
    }

    /// Flush both writers (each line is flushed on append; this is the
    /// close-out barrier for `collect`).
    pub fn flush(&self) {
        for file in [&self.events, &self.metrics] {
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
                let _ = f.sync_all();
            }
        }
    }

    fn append_line<T: serde::Serialize>(&self, file: &Mutex<File>, record: &T) {
        let mut line = match serde_json::to_vec(record) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(session = %self.run_id, error = %e, "cannot serialize telemetry line");
                return;
            }
        };
        line.push(b'\n');
        let mut f = file.lock().expect("telemetry writer lock");
        // Telemetry failures must not fail the run; they are surfaced via
        // tracing only.
        if let Err(e) = f.write_all(&line).and_then(|()| f.flush()) {
            tracing::error!(session = %self.run_id, error = %e, "cannot append telemetry line");
        }
    }

    /// Per-step driver context.
    pub fn step_ctx(self: &Arc<Self>, step_id: StepId, cancel: CancelToken) -> StepContext {
        StepContext { session: Arc::clone(self), step_id, cancel }
    }
}

/// The `RunContext` a driver sees: scoped to one step of one session.
pub struct StepContext {
    session: Arc<Session>,
    step_id: StepId,
    cancel: CancelToken,
}

impl StepContext {
    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }
}

impl RunContext for StepContext {
    fn log_event(&self, kind: EventKind, payload: JsonMap<String, Value>) {
        self.session.event(kind, payload);
    }

    fn log_metric(&self, name: &str, value: Number, unit: MetricUnit, tags: JsonMap<String, Value>) {
        self.session.metric(name, value, unit, tags);
    }

    fn artifact_path(&self, logical_name: &str) -> Result<PathBuf, DriverError> {
        let path = self
            .session
            .artifacts_root
            .as_std_path()
            .join(self.step_id.as_str())
            .join(logical_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn open_append(path: &Utf8PathBuf) -> Result<File, ExecError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent.as_std_path())?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path.as_std_path())?)
}
