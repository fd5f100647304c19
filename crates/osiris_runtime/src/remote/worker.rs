//! The sandbox-side worker: accepts RPC commands over a byte stream,
//! executes steps through the same step executor as the local runner, and
//! streams events/metrics/heartbeats back unsolicited.
//!
//! The worker writes artifacts only inside its package directory; the host
//! pulls them over `get_artifact` after each step so the observable artifact
//! tree lives on the host, byte-identical to a local run.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map as JsonMap, Number, Value};

use osiris_compiler::manifest::Manifest;
use osiris_core::driver::{CancelToken, DriverError, DriverRegistry};
use osiris_core::events::{EventKind, MetricUnit};
use osiris_core::ids::StepId;
use osiris_core::table::StepOutputs;
use osiris_io::connections::ResolvedConnection;

use crate::local::execute_one_step;
use crate::local::TelemetrySink;
use crate::remote::protocol::{
    self, read_frame, write_frame, Request, Response, CMD_CANCEL, CMD_EXEC_STEP, CMD_GET_ARTIFACT,
    CMD_PREPARE, CMD_SHUTDOWN,
};
use crate::RemoteError;

/// Default heartbeat cadence (host-side timeout is 30s).
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Telemetry sink that forwards everything as unsolicited frames. The worker
/// has no session and no redactor; the host reapplies redaction on merge.
struct ForwardingSink {
    writer: SharedWriter,
    package_dir: PathBuf,
    artifacts: Mutex<BTreeMap<String, Vec<String>>>,
}

impl ForwardingSink {
    fn send(&self, kind: &str, payload: Value) {
        let frame = json!({"kind": kind, "payload": payload});
        let mut w = self.writer.lock().expect("worker writer lock");
        if let Err(e) = write_frame(&mut *w, &frame) {
            tracing::error!(error = %e, "worker cannot write frame");
        }
    }

    fn artifacts_for(&self, step_id: &str) -> Vec<String> {
        self.artifacts
            .lock()
            .expect("artifact index lock")
            .get(step_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl TelemetrySink for ForwardingSink {
    fn event(&self, kind: EventKind, payload: JsonMap<String, Value>) {
        let mut body = payload;
        body.insert("event".into(), json!(kind.as_str()));
        body.insert("ts".into(), crate::session::Session::now_iso().into());
        self.send(protocol::UNSOLICITED_EVENT, Value::Object(body));
    }

    fn metric(&self, name: &str, value: Number, unit: MetricUnit, tags: JsonMap<String, Value>) {
        self.send(
            protocol::UNSOLICITED_METRIC,
            json!({
                "ts": crate::session::Session::now_iso(),
                "metric": name,
                "value": value,
                "unit": unit.as_str(),
                "tags": tags,
            }),
        );
    }

    fn artifact_path(&self, step_id: &StepId, logical_name: &str) -> Result<PathBuf, DriverError> {
        let path = self.package_dir.join("artifacts").join(step_id.as_str()).join(logical_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.artifacts
            .lock()
            .expect("artifact index lock")
            .entry(step_id.to_string())
            .or_default()
            .push(logical_name.to_owned());
        Ok(path)
    }
}

/// Loaded package state (after `prepare`).
struct PackageState {
    manifest: Manifest,
    step_configs: BTreeMap<String, JsonMap<String, Value>>,
    connections: BTreeMap<String, ResolvedConnection>,
}

fn load_package(package_dir: &Path) -> Result<PackageState, RemoteError> {
    let manifest_text = std::fs::read_to_string(package_dir.join("manifest.yaml"))
        .map_err(|e| RemoteError::WorkerProtocol(format!("package has no manifest: {e}")))?;
    let manifest: Manifest = serde_yaml::from_str(&manifest_text)
        .map_err(|e| RemoteError::WorkerProtocol(format!("bad package manifest: {e}")))?;

    let mut step_configs = BTreeMap::new();
    for step in &manifest.steps {
        let text = std::fs::read_to_string(package_dir.join(&step.config_path))
            .map_err(|e| RemoteError::WorkerProtocol(format!("missing step config {}: {e}", step.config_path)))?;
        let config: JsonMap<String, Value> = serde_yaml::from_str(&text)
            .map_err(|e| RemoteError::WorkerProtocol(format!("bad step config {}: {e}", step.config_path)))?;
        step_configs.insert(step.id.clone(), config);
    }

    // Resolved-connection snapshot; present only when the pipeline has
    // connections. It lives exclusively inside the sandbox scratch dir.
    let connections_path = package_dir.join("connections.json");
    let connections = if connections_path.exists() {
        let text = std::fs::read_to_string(&connections_path)
            .map_err(|e| RemoteError::WorkerProtocol(format!("cannot read connections snapshot: {e}")))?;
        let raw: BTreeMap<String, Value> = serde_json::from_str(&text)
            .map_err(|e| RemoteError::WorkerProtocol(format!("bad connections snapshot: {e}")))?;
        raw.into_iter()
            .map(|(step, v)| {
                let family = v.pointer("/family").and_then(Value::as_str).unwrap_or_default().to_owned();
                let alias = v.pointer("/alias").and_then(Value::as_str).unwrap_or_default().to_owned();
                let fields = v
                    .pointer("/fields")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                (step, ResolvedConnection { family, alias, fields })
            })
            .collect()
    } else {
        BTreeMap::new()
    };

    Ok(PackageState { manifest, step_configs, connections })
}

/// Serve the RPC loop until `shutdown` or EOF. Generic over the byte stream
/// so the CLI (stdin/stdout) and in-process tests (socket pairs) share it.
pub fn serve<R, W>(
    package_dir: &Path,
    drivers: Arc<DriverRegistry>,
    reader: R,
    writer: W,
    heartbeat: Duration,
) -> Result<(), RemoteError>
where
    R: Read,
    W: Write + Send + 'static,
{
    let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
    let sink = Arc::new(ForwardingSink {
        writer: Arc::clone(&writer),
        package_dir: package_dir.to_path_buf(),
        artifacts: Mutex::new(BTreeMap::new()),
    });

    // Heartbeat emitter: runs for the whole worker lifetime.
    let stop = Arc::new(AtomicBool::new(false));
    let beat_writer = Arc::clone(&writer);
    let beat_stop = Arc::clone(&stop);
    let beat_handle = std::thread::spawn(move || {
        while !beat_stop.load(Ordering::SeqCst) {
            {
                let mut w = beat_writer.lock().expect("worker writer lock");
                let _ = write_frame(&mut *w, &json!({"kind": protocol::UNSOLICITED_HEARTBEAT, "payload": {}}));
            }
            std::thread::sleep(heartbeat);
        }
    });

    let result = serve_loop(package_dir, &drivers, reader, &writer, &sink);

    stop.store(true, Ordering::SeqCst);
    // The emitter wakes within one heartbeat interval; joining keeps the
    // writer alive until it observed the stop flag.
    let _ = beat_handle.join();
    result
}

fn serve_loop<R: Read>(
    package_dir: &Path,
    drivers: &Arc<DriverRegistry>,
    mut reader: R,
    writer: &SharedWriter,
    sink: &Arc<ForwardingSink>,
) -> Result<(), RemoteError> {
    let mut state: Option<Arc<PackageState>> = None;
    let cache: Arc<Mutex<BTreeMap<String, StepOutputs>>> = Arc::new(Mutex::new(BTreeMap::new()));
    // One in-flight step at a time; it runs on its own thread so `cancel`
    // frames can still be read and flip its token mid-step.
    let mut in_flight: Option<(u64, CancelToken, std::thread::JoinHandle<()>)> = None;

    loop {
        // Reap a finished step before the next command.
        if let Some((_, _, handle)) = &in_flight {
            if handle.is_finished() {
                if let Some((_, _, handle)) = in_flight.take() {
                    let _ = handle.join();
                }
            }
        }

        let Some(frame) = read_frame(&mut reader)? else {
            tracing::debug!("worker input closed; exiting");
            if let Some((_, token, handle)) = in_flight.take() {
                token.cancel();
                let _ = handle.join();
            }
            return Ok(());
        };
        let request: Request = serde_json::from_value(frame)
            .map_err(|e| RemoteError::WorkerProtocol(format!("bad request frame: {e}")))?;

        match request.kind.as_str() {
            CMD_PREPARE => {
                let response = match load_package(package_dir) {
                    Ok(loaded) => {
                        state = Some(Arc::new(loaded));
                        Response::ok(request.id, json!({"status": "ready"}))
                    }
                    Err(e) => Response::err(request.id, e.to_string()),
                };
                respond(writer, &response);
            }
            CMD_EXEC_STEP => {
                let step_id = request
                    .payload
                    .get("step_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                match (&state, &in_flight) {
                    (None, _) => respond(writer, &Response::err(request.id, "exec_step before prepare")),
                    (_, Some(_)) => {
                        respond(writer, &Response::err(request.id, "another step is in flight"))
                    }
                    (Some(pkg), None) => {
                        let cancel = CancelToken::new();
                        let handle = spawn_exec(
                            Arc::clone(pkg),
                            Arc::clone(drivers),
                            Arc::clone(sink),
                            Arc::clone(&cache),
                            Arc::clone(writer),
                            request.id,
                            step_id,
                            cancel.clone(),
                        );
                        in_flight = Some((request.id, cancel, handle));
                    }
                }
            }
            CMD_GET_ARTIFACT => {
                let step = request.payload.get("step_id").and_then(Value::as_str).unwrap_or_default();
                let logical = request
                    .payload
                    .get("logical_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let path = package_dir.join("artifacts").join(step).join(logical);
                let response = match std::fs::read(&path) {
                    Ok(bytes) => Response::ok(request.id, json!({"data_hex": hex::encode(bytes)})),
                    Err(e) => Response::err(request.id, format!("no artifact {step}/{logical}: {e}")),
                };
                respond(writer, &response);
            }
            CMD_CANCEL => {
                let target = request.payload.get("id").and_then(Value::as_u64).unwrap_or_default();
                let hit = match &in_flight {
                    Some((id, token, _)) if *id == target => {
                        token.cancel();
                        true
                    }
                    _ => false,
                };
                respond(writer, &Response::ok(request.id, json!({"cancelled": hit})));
            }
            CMD_SHUTDOWN => {
                if let Some((_, token, handle)) = in_flight.take() {
                    token.cancel();
                    let _ = handle.join();
                }
                respond(writer, &Response::ok(request.id, json!({"status": "bye"})));
                return Ok(());
            }
            other => {
                respond(writer, &Response::err(request.id, format!("unknown command: {other}")));
            }
        }
    }
}

/// Run one step on its own thread; the response is written by that thread.
#[allow(clippy::too_many_arguments)]
fn spawn_exec(
    pkg: Arc<PackageState>,
    drivers: Arc<DriverRegistry>,
    sink: Arc<ForwardingSink>,
    cache: Arc<Mutex<BTreeMap<String, StepOutputs>>>,
    writer: SharedWriter,
    request_id: u64,
    step_id: String,
    cancel: CancelToken,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let response = match pkg.manifest.steps.iter().find(|s| s.id == step_id) {
            None => Response::err(request_id, format!("unknown step: {step_id}")),
            Some(step) => {
                let config = pkg.step_configs.get(&step_id).cloned().unwrap_or_default();
                let resolved = pkg.connections.get(&step_id);
                let dyn_sink: Arc<dyn TelemetrySink> = Arc::clone(&sink) as Arc<dyn TelemetrySink>;
                let mut cache_guard = cache.lock().expect("cache lock");
                let result = execute_one_step(
                    &dyn_sink,
                    &drivers,
                    step,
                    &config,
                    resolved,
                    &mut cache_guard,
                    &cancel,
                );
                drop(cache_guard);
                match result {
                    Ok(outcome) => Response::ok(
                        request_id,
                        json!({
                            "status": "completed",
                            "rows_processed": outcome.rows,
                            "duration_ms": outcome.duration_ms,
                            "mode": outcome.mode,
                            "artifacts": sink.artifacts_for(&step_id),
                        }),
                    ),
                    Err(e) => Response::err(request_id, e.to_string()),
                }
            }
        };
        respond(&writer, &response);
    })
}

fn respond(writer: &SharedWriter, response: &Response) {
    let v = serde_json::to_value(response).expect("response serialization cannot fail");
    let mut w = writer.lock().expect("worker writer lock");
    if let Err(e) = write_frame(&mut *w, &v) {
        tracing::error!(error = %e, "worker cannot write response");
    }
}
