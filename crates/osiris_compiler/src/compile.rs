//! Deterministic transformation OML → Manifest.
//!
//! Stages (all pure given the explicit inputs):
//!   1. validate (three layers; any error aborts before side effects)
//!   2. topological order, authored order breaking ties
//!   3. per-step canonical config (spec defaults where absent, connection
//!      collapsed to a symbolic reference, meta keys dropped, keys sorted)
//!   4. fingerprint via hash-field elision
//!   5. materialize manifest.yaml + steps/<id>.yaml + latest pointer
//!
//! No secret value can reach a compiled artifact: the compiler only ever
//! sees symbolic connection references and `${ENV}` placeholders.

use serde_json::{Map as JsonMap, Value};

use camino::Utf8PathBuf;
use osiris_core::ids::{ManifestHash, PipelineSlug};
use osiris_core::oml::OmlDocument;
use osiris_io::canonical::{to_canonical_yaml, to_canonical_yaml_string, write_atomic};
use osiris_io::connections::ConnectionResolver;
use osiris_io::fs_contract::FilesystemContract;
use osiris_io::registry::Registry;

use crate::manifest::{finalize_manifest, Manifest, ManifestDraft, ManifestPipeline, ManifestStep};
use crate::validate::{topological_order, upstream_ids, validate_oml, META_CONFIG_KEYS};
use crate::CompileError;

/// Compiler inputs beyond the document itself. `generated_at` is explicit so
/// identical inputs compile to identical bytes.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Overrides the document's profile when set.
    pub profile: Option<String>,
    /// RFC 3339 UTC `Z`; stamped into `meta.generated_at`.
    pub generated_at: String,
}

impl CompileOptions {
    /// Options stamped with the current wall clock (the CLI path).
    pub fn now() -> Self {
        CompileOptions {
            profile: None,
            generated_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }
}

/// Everything a caller needs after a successful compile.
#[derive(Debug, Clone)]
pub struct CompiledPipeline {
    pub manifest: Manifest,
    pub hash: ManifestHash,
    pub slug: PipelineSlug,
    pub profile: String,
    pub build_dir: Utf8PathBuf,
    pub manifest_path: Utf8PathBuf,
}

/// Compile a raw OML value. Validation failures abort before any file is
/// written.
pub fn compile(
    raw: &Value,
    registry: &Registry,
    resolver: &ConnectionResolver,
    fsc: &FilesystemContract,
    opts: &CompileOptions,
) -> Result<CompiledPipeline, CompileError> {
    let report = validate_oml(raw, registry, resolver);
    if !report.ok {
        return Err(CompileError::ValidationFailed(report));
    }
    let doc = OmlDocument::from_value(raw)
        .map_err(|e| CompileError::Canonicalization(format!("typed parse after validation: {e}")))?;

    let slug = PipelineSlug::from_name(&doc.name)
        .map_err(|e| CompileError::Canonicalization(format!("cannot slug pipeline name: {e}")))?;
    let profile = opts.profile.clone().unwrap_or_else(|| doc.profile().to_owned());

    // Stable topological order.
    let order = topological_order(&doc);

    // Canonical per-step configs, in execution order.
    let mut steps = Vec::with_capacity(doc.steps.len());
    let mut configs: Vec<(String, JsonMap<String, Value>)> = Vec::with_capacity(doc.steps.len());
    for step_id in &order {
        let step = doc
            .steps
            .iter()
            .find(|s| s.id == step_id.as_str())
            .expect("ordered ids come from the document");
        let cached = registry.get(&step.component)?;
        let spec = &cached.spec;

        let config = canonical_step_config(step, spec, resolver);
        let connection = config
            .get("connection")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let mut needs: Vec<String> = upstream_ids(step).into_iter().map(str::to_owned).collect();
        needs.sort();

        steps.push(ManifestStep {
            id: step.id.clone(),
            component: step.component.clone(),
            mode: step.mode,
            driver: spec.runtime.driver.clone(),
            config_path: format!("steps/{}.yaml", step.id),
            needs,
            connection,
            inputs: step.inputs.clone(),
        });
        configs.push((step.id.clone(), config));
    }

    let (manifest, hash) = finalize_manifest(ManifestDraft {
        generated_at: opts.generated_at.clone(),
        oml_version: doc.oml_version.clone(),
        profile: profile.clone(),
        pipeline: ManifestPipeline { id: slug.to_string(), name: doc.name.clone() },
        steps,
    })?;

    // Materialize the build tree.
    let build_dir = fsc.build_dir(&profile, &slug, &hash);
    let manifest_path = fsc.manifest_path(&profile, &slug, &hash);
    tracing::debug!(manifest = %manifest_path, hash = %hash, "writing compiled manifest");

    let manifest_yaml = to_canonical_yaml(&manifest)?;
    write_atomic(manifest_path.as_std_path(), manifest_yaml.as_bytes())
        .map_err(osiris_io::IoError::from)?;
    for (step_id, config) in &configs {
        let step_path = build_dir.join("steps").join(format!("{step_id}.yaml"));
        let yaml = to_canonical_yaml_string(&Value::Object(config.clone()))?;
        write_atomic(step_path.as_std_path(), yaml.as_bytes())
            .map_err(osiris_io::IoError::from)?;
    }

    // Latest-manifest pointer for `run --last-compile`.
    let pointer = fsc.latest_pointer_path(&slug);
    write_atomic(pointer.as_std_path(), format!("{manifest_path}\n").as_bytes())
        .map_err(osiris_io::IoError::from)?;

    Ok(CompiledPipeline { manifest, hash, slug, profile, build_dir, manifest_path })
}

/// Canonical config for one step:
/// - spec defaults materialized where the author left a field unset,
/// - connection collapsed to `config.connection: "@family.alias"` (the
///   family default when the author gave none),
/// - meta-only keys dropped,
/// - key order canonicalized by serialization downstream.
fn canonical_step_config(
    step: &osiris_core::oml::OmlStep,
    spec: &osiris_io::registry::ComponentSpec,
    resolver: &ConnectionResolver,
) -> JsonMap<String, Value> {
    let mut config = JsonMap::new();

    for (name, default) in spec.schema_defaults() {
        config.insert(name, default);
    }
    for (k, v) in &step.config {
        if META_CONFIG_KEYS.contains(&k.as_str()) {
            continue;
        }
        config.insert(k.clone(), v.clone());
    }

    // Collapse to a symbolic reference when the component is
    // connection-backed and the author relied on the family default.
    if !spec.connection_fields.is_empty() && !config.contains_key("connection") {
        let family = step.component.split('.').next().unwrap_or_default();
        if let Some(alias) = resolver.default_alias(family) {
            config.insert("connection".into(), Value::String(format!("@{family}.{alias}")));
        }
    }

    config
}
