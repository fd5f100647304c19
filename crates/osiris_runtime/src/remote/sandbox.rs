//! Sandbox staging and worker launching.
//!
//! The sandbox is an isolated worker process with a scratch directory as its
//! whole world. "Uploading" the prepared run means staging the minimal
//! package into that directory: the manifest, the materialized step configs,
//! and (only because the transport requires it) the resolved-connection
//! snapshot. The scratch directory is deleted on teardown, success or not.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use serde_json::{json, Map as JsonMap, Value};

use crate::adapter::PreparedRun;
use crate::RemoteError;

/// A launched worker: its byte streams plus the process to tear down (absent
/// for in-process workers in tests).
pub struct SandboxHandle {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Option<Child>,
}

impl SandboxHandle {
    /// Kill the worker process if one exists. Idempotent; never fails the
    /// run (teardown happens on error paths too).
    pub fn teardown(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.child = None;
    }
}

/// How a worker comes to life. Subprocess in production; a thread over a
/// socket pair in tests.
pub trait SandboxLauncher: Send + Sync {
    fn launch(&self, package_dir: &Path) -> Result<SandboxHandle, RemoteError>;
}

/// Spawns `<cmd...> --package <dir>` with stdin/stdout as the RPC channel.
/// Worker logs go to stderr (inherited); stdout carries frames only.
pub struct SubprocessLauncher {
    pub cmd: Vec<String>,
}

impl SubprocessLauncher {
    /// The production launcher: this very binary's hidden `worker` command.
    pub fn current_exe() -> Result<Self, RemoteError> {
        let exe = std::env::current_exe()
            .map_err(|e| RemoteError::SandboxCreateFailed(format!("cannot locate own binary: {e}")))?;
        Ok(SubprocessLauncher { cmd: vec![exe.to_string_lossy().into_owned(), "worker".into()] })
    }
}

impl SandboxLauncher for SubprocessLauncher {
    fn launch(&self, package_dir: &Path) -> Result<SandboxHandle, RemoteError> {
        let (program, args) = self
            .cmd
            .split_first()
            .ok_or_else(|| RemoteError::SandboxCreateFailed("empty worker command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .arg("--package")
            .arg(package_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| RemoteError::SandboxCreateFailed(format!("cannot spawn worker: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RemoteError::SandboxCreateFailed("worker has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RemoteError::SandboxCreateFailed("worker has no stdout".into()))?;

        Ok(SandboxHandle { reader: Box::new(stdout), writer: Box::new(stdin), child: Some(child) })
    }
}

/// Scratch directory for one run's sandbox.
pub fn scratch_dir(run_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("osiris-sandbox-{run_id}"))
}

/// Stage the minimal package allowlist into `dir`:
///   manifest.yaml, steps/<id>.yaml, connections.json (only if non-empty).
pub fn stage_package(prepared: &PreparedRun, dir: &Path) -> Result<(), RemoteError> {
    let fail = |e: &dyn std::fmt::Display| RemoteError::SandboxCreateFailed(e.to_string());

    std::fs::create_dir_all(dir.join("steps")).map_err(|e| fail(&e))?;
    std::fs::create_dir_all(dir.join("artifacts")).map_err(|e| fail(&e))?;

    let manifest_yaml =
        osiris_io::canonical::to_canonical_yaml(&prepared.manifest).map_err(|e| fail(&e))?;
    std::fs::write(dir.join("manifest.yaml"), manifest_yaml).map_err(|e| fail(&e))?;

    for (step_id, config) in &prepared.step_configs {
        let yaml = osiris_io::canonical::to_canonical_yaml_string(&Value::Object(config.clone()))
            .map_err(|e| fail(&e))?;
        std::fs::write(dir.join("steps").join(format!("{step_id}.yaml")), yaml)
            .map_err(|e| fail(&e))?;
    }

    if !prepared.connections.is_empty() {
        let mut snapshot = JsonMap::new();
        for (step_id, conn) in &prepared.connections {
            snapshot.insert(
                step_id.clone(),
                json!({
                    "family": conn.family,
                    "alias": conn.alias,
                    "fields": conn.fields,
                }),
            );
        }
        let bytes = serde_json::to_vec(&Value::Object(snapshot)).map_err(|e| fail(&e))?;
        std::fs::write(dir.join("connections.json"), bytes).map_err(|e| fail(&e))?;
    }
    Ok(())
}

/// Best-effort removal of the scratch directory (secrets live there).
pub fn remove_scratch(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot remove sandbox scratch dir");
        }
    }
}
