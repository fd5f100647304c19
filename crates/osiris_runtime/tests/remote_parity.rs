//! Remote parity smoke: the same manifest through the local runner and
//! through the transparent proxy against an in-process worker. Event kinds,
//! metric names, artifact bytes, totals, and manifest hashes must match;
//! only timings and the additive sandbox bootstrap events may differ.

#![cfg(unix)]

mod common;

use std::collections::BTreeSet;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{event_kinds, fixture, read_jsonl};

use osiris_core::driver::DriverRegistry;
use osiris_io::run_index::RunStatus;
use osiris_runtime::remote::proxy::RemoteConfig;
use osiris_runtime::remote::sandbox::{SandboxHandle, SandboxLauncher};
use osiris_runtime::remote::worker;
use osiris_runtime::{ExecutionAdapter, RemoteError};

/// Runs the real worker serve loop on a thread over a socket pair: the
/// whole protocol (framing, heartbeats, artifact fetch) without a process
/// boundary.
struct ThreadLauncher {
    drivers: Arc<DriverRegistry>,
    heartbeat: Duration,
}

impl SandboxLauncher for ThreadLauncher {
    fn launch(&self, package_dir: &Path) -> Result<SandboxHandle, RemoteError> {
        let (host, sandbox) = UnixStream::pair()
            .map_err(|e| RemoteError::SandboxCreateFailed(e.to_string()))?;
        let reader_side = sandbox
            .try_clone()
            .map_err(|e| RemoteError::SandboxCreateFailed(e.to_string()))?;

        let package = package_dir.to_path_buf();
        let drivers = Arc::clone(&self.drivers);
        let heartbeat = self.heartbeat;
        std::thread::spawn(move || {
            if let Err(e) = worker::serve(&package, drivers, reader_side, sandbox, heartbeat) {
                eprintln!("worker thread: {e}");
            }
        });

        let host_reader = host
            .try_clone()
            .map_err(|e| RemoteError::SandboxCreateFailed(e.to_string()))?;
        Ok(SandboxHandle {
            reader: Box::new(host_reader),
            writer: Box::new(host),
            child: None,
        })
    }
}

fn remote_adapter(drivers: Arc<DriverRegistry>) -> ExecutionAdapter {
    let launcher = ThreadLauncher { drivers, heartbeat: Duration::from_millis(200) };
    let mut config = RemoteConfig::new(Arc::new(launcher));
    config.heartbeat_timeout = Duration::from_secs(5);
    config.sandbox_timeout = Duration::from_secs(30);
    ExecutionAdapter::Remote(config)
}

#[test]
fn local_and_remote_runs_match_at_the_observation_layer() {
    let local_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    let local_fx = fixture(local_dir.path());
    let remote_fx = fixture(remote_dir.path());

    // Identical inputs ⇒ identical fingerprints, before anything runs.
    assert_eq!(local_fx.manifest_hash, remote_fx.manifest_hash);

    let local = ExecutionAdapter::Local.run(&local_fx.manifest_path, &local_fx.ctx).unwrap();
    let remote = remote_adapter(Arc::clone(&remote_fx.ctx.drivers))
        .run(&remote_fx.manifest_path, &remote_fx.ctx)
        .unwrap();

    assert_eq!(local.record.status, RunStatus::Completed);
    assert_eq!(remote.record.status, RunStatus::Completed);
    assert_eq!(local.record.total_rows, remote.record.total_rows);
    assert_eq!(local.record.manifest_hash, remote.record.manifest_hash);

    // Event-kind multisets match once the remote-only additive bootstrap
    // events are set aside.
    let mut local_kinds = event_kinds(&read_jsonl(&local.events_path));
    let mut remote_kinds: Vec<String> = event_kinds(&read_jsonl(&remote.events_path))
        .into_iter()
        .filter(|k| !k.starts_with("sandbox_bootstrap"))
        .collect();
    local_kinds.sort();
    remote_kinds.sort();
    assert_eq!(local_kinds, remote_kinds);

    // Metric-name sets match.
    let names = |path| -> BTreeSet<String> {
        read_jsonl(path)
            .iter()
            .map(|m| m["metric"].as_str().unwrap().to_owned())
            .collect()
    };
    assert_eq!(names(&local.metrics_path), names(&remote.metrics_path));

    // Writer output is byte-identical.
    let local_csv = std::fs::read(local.artifacts_dir.join("write/out.csv").as_std_path()).unwrap();
    let remote_csv = std::fs::read(remote.artifacts_dir.join("write/out.csv").as_std_path()).unwrap();
    assert_eq!(local_csv, remote_csv);
    assert_eq!(local_csv, b"id\n1\n2\n3\n");

    // The remote session's event stream is attributed to the remote session
    // id throughout, including worker-forwarded step events.
    let remote_events = read_jsonl(&remote.events_path);
    for event in &remote_events {
        assert_eq!(event["session"], remote.record.run_id.as_str());
    }

    // Sandbox bootstrap events did happen (additive, not substitutive).
    let remote_all = event_kinds(&remote_events);
    assert!(remote_all.contains(&"sandbox_bootstrap_start".to_string()));
    assert!(remote_all.contains(&"sandbox_bootstrap_complete".to_string()));
}

#[test]
fn worker_driver_failure_fails_the_remote_run() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path());

    // Sabotage the extractor config (rows must be an array).
    let steps_dir = fx.manifest_path.parent().unwrap().join("steps");
    let cfg = steps_dir.join("extract.yaml");
    let text = std::fs::read_to_string(cfg.as_std_path()).unwrap();
    std::fs::write(cfg.as_std_path(), text.replace("rows:", "rows_disabled:")).unwrap();

    let collected = remote_adapter(Arc::clone(&fx.ctx.drivers))
        .run(&fx.manifest_path, &fx.ctx)
        .unwrap();
    assert_eq!(collected.record.status, RunStatus::Failed);
    assert!(!collected.record.ended_at.is_empty());

    let kinds = event_kinds(&read_jsonl(&collected.events_path));
    // The worker streamed the failure; the host still closed the run.
    assert!(kinds.contains(&"step_failed".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("run_end"));
}

#[test]
fn dead_sandbox_is_a_remote_error_with_failed_record() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path());

    /// A launcher whose worker dies immediately: the host sees EOF instead
    /// of a prepare response.
    struct DeadLauncher;
    impl SandboxLauncher for DeadLauncher {
        fn launch(&self, _package_dir: &Path) -> Result<SandboxHandle, RemoteError> {
            let (host, sandbox) = UnixStream::pair()
                .map_err(|e| RemoteError::SandboxCreateFailed(e.to_string()))?;
            drop(sandbox);
            let reader = host.try_clone().map_err(|e| RemoteError::SandboxCreateFailed(e.to_string()))?;
            Ok(SandboxHandle { reader: Box::new(reader), writer: Box::new(host), child: None })
        }
    }

    let mut config = RemoteConfig::new(Arc::new(DeadLauncher));
    config.heartbeat_timeout = Duration::from_secs(2);
    config.sandbox_timeout = Duration::from_secs(5);

    let collected = ExecutionAdapter::Remote(config).run(&fx.manifest_path, &fx.ctx).unwrap();
    assert_eq!(collected.record.status, RunStatus::Failed);
    assert!(!collected.record.ended_at.is_empty());
    let kinds = event_kinds(&read_jsonl(&collected.events_path));
    assert_eq!(kinds.last().map(String::as_str), Some("run_end"));
}
