//! The execution adapter: one three-phase lifecycle (`prepare → execute →
//! collect`), polymorphic over where the steps actually run.
//!
//! Callers never branch on the variant: both produce the same
//! `ExecutionResult` / `CollectedRun` records, the same event and metric
//! kinds, the same artifact layout, and the same run-index record shape.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use camino::Utf8PathBuf;
use serde_json::{json, Map as JsonMap, Value};

use osiris_compiler::manifest::{verify_hash, Manifest};
use osiris_core::driver::{CancelToken, DriverRegistry};
use osiris_core::events::EventKind;
use osiris_core::ids::{ManifestHash, PipelineSlug};
use osiris_core::redact::Redactor;
use osiris_io::connections::{ConnectionResolver, EnvSource, ResolvedConnection};
use osiris_io::fs_contract::FilesystemContract;
use osiris_io::registry::{OverridePolicy, Registry};
use osiris_io::run_index::{RunIndexReader, RunIndexWriter, RunRecord};

use crate::local::{obj, run_local, RunOutcome};
use crate::remote::proxy::RemoteConfig;
use crate::session::{mint_run_id, Session};
use crate::ExecError;

/// Process-wide collaborators, initialized once at startup and read-only
/// afterwards. Drivers and specs are passed explicitly; nothing here is a
/// global.
pub struct ExecutionContext {
    pub fsc: FilesystemContract,
    pub registry: Arc<Registry>,
    pub drivers: Arc<DriverRegistry>,
    pub resolver: Arc<ConnectionResolver>,
    pub env: Arc<dyn EnvSource + Send + Sync>,
}

/// Everything materialized before execution starts. Resolved connections
/// live only in memory here; the remote adapter serializes them into the
/// sandbox package (and only there) because the transport requires it.
#[derive(Debug)]
pub struct PreparedRun {
    pub manifest: Manifest,
    pub hash: ManifestHash,
    pub slug: PipelineSlug,
    pub profile: String,
    pub manifest_path: Utf8PathBuf,
    pub build_dir: Utf8PathBuf,
    pub step_configs: BTreeMap<String, JsonMap<String, Value>>,
    pub connections: BTreeMap<String, ResolvedConnection>,
    pub redactor: Redactor,
    pub warnings: Vec<String>,
}

/// Execution phase output; `collect` consumes it.
pub struct ExecutionResult {
    pub prepared: PreparedRun,
    pub session: Arc<Session>,
    pub outcome: RunOutcome,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

/// Collect phase output: the appended run record plus the session paths a
/// post-processor (AIOP export) needs.
#[derive(Debug, Clone)]
pub struct CollectedRun {
    pub record: RunRecord,
    pub aiop_dir: Utf8PathBuf,
    pub events_path: Utf8PathBuf,
    pub metrics_path: Utf8PathBuf,
    pub artifacts_dir: Utf8PathBuf,
    pub manifest_path: Utf8PathBuf,
    /// The session's captured fatal error, when the run did not complete
    /// (callers map its kind to exit codes without re-reading events).
    pub fatal: Option<crate::session::FatalError>,
}

/// Sum type over execution variants (polymorphism over capability).
pub enum ExecutionAdapter {
    Local,
    Remote(RemoteConfig),
}

impl ExecutionAdapter {
    /// Phase 1: load and integrity-check the manifest, materialize step
    /// configs, check driver bindings, resolve connections, seed redaction.
    /// No session exists yet; failures here leave no trace on disk.
    pub fn prepare(&self, manifest_path: &Utf8PathBuf, ctx: &ExecutionContext) -> Result<PreparedRun, ExecError> {
        let text = std::fs::read_to_string(manifest_path.as_std_path())?;
        let manifest: Manifest = serde_yaml::from_str(&text)
            .map_err(|e| ExecError::Manifest(format!("cannot parse manifest: {e}")))?;

        let value = serde_json::to_value(&manifest)
            .map_err(|e| ExecError::Manifest(format!("cannot reserialize manifest: {e}")))?;
        match verify_hash(&value) {
            Ok(true) => {}
            Ok(false) => {
                return Err(ExecError::Manifest(format!(
                    "manifest fingerprint mismatch for {manifest_path}"
                )))
            }
            Err(e) => return Err(ExecError::Manifest(e.to_string())),
        }

        let hash: ManifestHash = manifest
            .meta
            .manifest_hash
            .parse()
            .map_err(|e| ExecError::Manifest(format!("bad manifest_hash: {e}")))?;
        let slug: PipelineSlug = manifest
            .pipeline
            .id
            .parse()
            .map_err(|e| ExecError::Manifest(format!("bad pipeline id: {e}")))?;
        let profile = manifest.meta.profile.clone();
        let build_dir = manifest_path
            .parent()
            .map(Utf8PathBuf::from)
            .ok_or_else(|| ExecError::Manifest("manifest path has no parent".into()))?;

        // Materialized canonical configs.
        let mut step_configs = BTreeMap::new();
        for step in &manifest.steps {
            let path = build_dir.join(&step.config_path);
            let text = std::fs::read_to_string(path.as_std_path())?;
            let config: JsonMap<String, Value> = serde_yaml::from_str(&text)
                .map_err(|e| ExecError::Manifest(format!("bad step config {}: {e}", step.config_path)))?;
            step_configs.insert(step.id.clone(), config);
        }

        // Missing driver is fatal before anything runs.
        for step in &manifest.steps {
            if !ctx.drivers.contains(&step.driver) {
                return Err(ExecError::UnknownDriver(step.driver.clone()));
            }
        }

        // Redaction seed: spec secret pointers and forbidden-override fields
        // for every component in the pipeline.
        let mut redactor = Redactor::new();
        for step in &manifest.steps {
            if let Ok(cached) = ctx.registry.get(&step.component) {
                for ptr in &cached.spec.secrets {
                    redactor.add_pointer(ptr);
                }
                for policy in &cached.spec.connection_fields {
                    if policy.policy == OverridePolicy::Forbidden {
                        redactor.add_field(&policy.name);
                    }
                }
            }
        }

        // Resolve connections now, once; execution only echoes events.
        let mut connections = BTreeMap::new();
        let mut warnings = Vec::new();
        for step in &manifest.steps {
            let Some(conn) = &step.connection else { continue };
            let r = conn
                .parse()
                .map_err(|e| ExecError::Manifest(format!("bad connection ref in manifest: {e}")))?;
            let policies = ctx
                .registry
                .get(&step.component)
                .map(|c| c.spec.connection_fields.clone())
                .unwrap_or_default();
            let config = step_configs.get(&step.id).cloned().unwrap_or_default();
            let (resolved, diags) = ctx.resolver.resolve(&r, &config, &policies, ctx.env.as_ref())?;

            // Every resolved secret value gets scrubbed from every output.
            for (field, value) in &resolved.fields {
                if redactor.is_secret_field(field) {
                    if let Value::String(s) = value {
                        redactor.add_value(s);
                    }
                }
            }
            warnings.extend(diags.warnings.into_iter().map(|w| format!("{}: {w}", step.id)));
            connections.insert(step.id.clone(), resolved);
        }

        Ok(PreparedRun {
            manifest,
            hash,
            slug,
            profile,
            manifest_path: manifest_path.clone(),
            build_dir,
            step_configs,
            connections,
            redactor,
            warnings,
        })
    }

    /// Phase 2: mint the session and drive the DAG, streaming telemetry in
    /// real time. The session exists from here on, success or failure.
    pub fn execute(&self, prepared: PreparedRun, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecError> {
        let run_id = mint_run_id();
        let session = Session::create(&ctx.fsc, run_id, prepared.redactor.clone())?;
        let cancel = CancelToken::new();

        let started_at = Session::now_iso();
        let started = Instant::now();
        session.event(
            EventKind::RunStart,
            obj(&[
                ("pipeline_id", json!(prepared.slug.as_str())),
                ("manifest_hash", json!(prepared.hash.as_hex())),
                ("profile", json!(prepared.profile)),
            ]),
        );
        for warning in &prepared.warnings {
            tracing::warn!(session = %session.run_id(), "{warning}");
        }

        let outcome = match self {
            ExecutionAdapter::Local => run_local(&prepared, &ctx.drivers, &session, &cancel),
            ExecutionAdapter::Remote(config) => {
                crate::remote::proxy::run_remote(&prepared, &session, config, &cancel)
            }
        };

        let ended_at = Session::now_iso();
        Ok(ExecutionResult {
            prepared,
            session,
            outcome,
            started_at,
            ended_at,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Phase 3: flush telemetry, append the run record, hand back aggregates.
    /// Runs on failures too: a lost sandbox still yields a complete record
    /// with `status: failed` and a non-null `ended_at`.
    pub fn collect(&self, result: ExecutionResult, ctx: &ExecutionContext) -> Result<CollectedRun, ExecError> {
        let ExecutionResult { prepared, session, outcome, started_at, ended_at, duration_ms } = result;
        session.flush();

        let reader = RunIndexReader::new(&ctx.fsc);
        let run_seq = reader.count_for_manifest(prepared.hash.as_hex())? + 1;
        let aiop_dir = ctx.fsc.aiop_run_dir(
            &prepared.profile,
            &prepared.slug,
            &prepared.hash,
            run_seq,
            session.run_id(),
        );

        let record = RunRecord {
            run_id: session.run_id().clone(),
            pipeline_slug: prepared.slug.clone(),
            manifest_hash: prepared.hash.as_hex().to_owned(),
            manifest_short: prepared.hash.short().as_str().to_owned(),
            profile: prepared.profile.clone(),
            started_at,
            ended_at,
            status: outcome.status,
            duration_ms,
            total_rows: outcome.total_rows,
            aiop_path: aiop_dir.to_string(),
            artifacts_path: session.artifacts_root().to_string(),
        };
        RunIndexWriter::new(&ctx.fsc).append(&record)?;
        tracing::info!(
            session = %session.run_id(),
            status = record.status.as_str(),
            total_rows = record.total_rows,
            "run record appended"
        );

        Ok(CollectedRun {
            record,
            aiop_dir,
            events_path: session.events_path().clone(),
            metrics_path: session.metrics_path().clone(),
            artifacts_dir: session.artifacts_root().clone(),
            manifest_path: prepared.manifest_path.clone(),
            fatal: session.fatal(),
        })
    }

    /// Convenience wrapper over the three phases.
    pub fn run(&self, manifest_path: &Utf8PathBuf, ctx: &ExecutionContext) -> Result<CollectedRun, ExecError> {
        let prepared = self.prepare(manifest_path, ctx)?;
        let result = self.execute(prepared, ctx)?;
        self.collect(result, ctx)
    }
}
