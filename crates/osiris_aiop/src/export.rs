//! AIOP assembly and writing: size-bounded `summary.json`, `run-card.md`,
//! optional NDJSON annex shards, and the cross-run delta.

use std::io::Write;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use serde_json::{json, Map as JsonMap, Value};

use osiris_compiler::manifest::Manifest;
use osiris_core::ids::ManifestHash;
use osiris_io::canonical::{to_canonical_json_bytes, write_atomic, write_canonical_json_file};
use osiris_io::fs_contract::{FilesystemContract, ANNEX_DIR, RUN_CARD_FILE, SUMMARY_FILE};
use osiris_io::registry::Registry;
use osiris_io::run_index::{RunIndexReader, RunRecord};

use crate::layers::{build_evidence, build_narrative, build_semantic, read_jsonl, Evidence};
use crate::policy::{AiopPolicy, ExportPolicy, TimelineDensity};
use crate::AiopError;

/// Everything the exporter needs; all paths derive from the record and the
/// filesystem contract.
pub struct ExportInputs<'a> {
    pub fsc: &'a FilesystemContract,
    pub record: &'a RunRecord,
    /// Component metadata for the semantic layer (optional: export still
    /// works from a bare run directory).
    pub registry: Option<&'a Registry>,
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub aiop_dir: Utf8PathBuf,
    pub summary_path: Utf8PathBuf,
    pub run_card_path: Utf8PathBuf,
    pub annex_files: Vec<String>,
    /// Truncation markers applied (empty = nothing truncated; non-empty maps
    /// to the CLI's warning exit code).
    pub truncated: Vec<String>,
}

/// Export one run's AIOP. Deterministic: for a fixed run directory and a
/// fixed policy, the written `summary.json` bytes are identical across
/// exports.
pub fn export(inputs: &ExportInputs<'_>, policy: &AiopPolicy) -> Result<ExportOutcome, AiopError> {
    let record = inputs.record;
    let hash: ManifestHash = record
        .manifest_hash
        .parse()
        .map_err(|e| AiopError::Input(format!("bad manifest_hash in record: {e}")))?;

    // Load the manifest and the session streams.
    let manifest_path = inputs.fsc.manifest_path(&record.profile, &record.pipeline_slug, &hash);
    let manifest_text = std::fs::read_to_string(manifest_path.as_std_path())
        .map_err(|e| AiopError::Input(format!("cannot read manifest {manifest_path}: {e}")))?;
    let manifest: Manifest = serde_yaml::from_str(&manifest_text)
        .map_err(|e| AiopError::Input(format!("bad manifest {manifest_path}: {e}")))?;

    let events = read_jsonl(inputs.fsc.events_path(&record.run_id).as_std_path())?;
    let metrics = read_jsonl(inputs.fsc.metrics_path(&record.run_id).as_std_path())?;
    let artifacts_dir = inputs.fsc.artifacts_dir(&record.run_id);

    // Build at the requested density, then degrade deterministically until
    // the core fits. Each degradation leaves an explicit marker.
    let mut effective = policy.clone();
    let mut truncated: Vec<String> = Vec::new();
    let (evidence, narrative) = loop {
        let evidence = build_evidence(events.clone(), metrics.clone(), artifacts_dir.as_std_path(), &effective)?;
        let narrative = {
            let full = build_narrative(
                &manifest,
                record.status.as_str(),
                record.total_rows,
                record.duration_ms,
                &evidence,
            );
            if truncated.iter().any(|t| t == "narrative_head") {
                full.into_iter().take(1).collect::<Vec<_>>()
            } else {
                full
            }
        };
        let semantic = build_semantic(&manifest, inputs.registry, effective.schema_mode);
        let core_len = core_bytes(&evidence, &narrative, &semantic);
        if core_len <= effective.max_core_bytes {
            break (evidence, narrative);
        }
        // Degradation ladder: timeline → metrics → narrative. After the last
        // rung the document ships oversized rather than empty.
        if effective.timeline_density != TimelineDensity::Minimal {
            effective.timeline_density = TimelineDensity::Minimal;
            truncated.push("timeline_minimal".into());
        } else if effective.metrics_topk > 1 {
            effective.metrics_topk = 1;
            truncated.push("metrics_top1".into());
        } else if !truncated.iter().any(|t| t == "narrative_head") {
            truncated.push("narrative_head".into());
        } else {
            truncated.push("oversized_core".into());
            break (evidence, narrative);
        }
    };
    let semantic = build_semantic(&manifest, inputs.registry, effective.schema_mode);

    // Annex: full streams, written when requested or when truncation dropped
    // content from the core.
    let aiop_dir = Utf8PathBuf::from(record.aiop_path.as_str());
    let annex_wanted = policy.policy == ExportPolicy::Annex || !truncated.is_empty();
    let annex_files = if annex_wanted {
        write_annex(aiop_dir.as_std_path(), &evidence, policy.annex_gzip)?
    } else {
        Vec::new()
    };

    // Delta vs the previous completed run of the same manifest (pure-hex
    // lookup; status is orthogonal to hash identity).
    let reader = RunIndexReader::new(inputs.fsc);
    let previous = reader.find_previous(&record.manifest_hash, Some(&record.run_id))?;
    let delta = match &previous {
        None => json!({"first_run": true}),
        Some(prev) => json!({
            "first_run": false,
            "previous_run_id": prev.run_id.as_str(),
            "total_rows_delta": record.total_rows as i64 - prev.total_rows as i64,
            "duration_ms_delta": record.duration_ms as i64 - prev.duration_ms as i64,
        }),
    };

    // Metadata layer (excluded from the core-size measure by definition).
    let mut metadata = JsonMap::new();
    metadata.insert("run_id".into(), json!(record.run_id.as_str()));
    metadata.insert("manifest_hash".into(), json!(record.manifest_hash));
    metadata.insert("manifest_short".into(), json!(record.manifest_short));
    metadata.insert("profile".into(), json!(record.profile));
    metadata.insert("status".into(), json!(record.status.as_str()));
    metadata.insert("started_at".into(), json!(record.started_at));
    metadata.insert("ended_at".into(), json!(record.ended_at));
    metadata.insert("duration_ms".into(), json!(record.duration_ms));
    metadata.insert("total_rows".into(), json!(record.total_rows));
    metadata.insert("delta".into(), delta);
    metadata.insert(
        "policy".into(),
        json!({
            "max_core_bytes": policy.max_core_bytes,
            "timeline_density": policy.timeline_density.as_str(),
            "metrics_topk": policy.metrics_topk,
            "schema_mode": policy.schema_mode.as_str(),
            "policy": policy.policy.as_str(),
        }),
    );
    metadata.insert(
        "size".into(),
        json!({
            "core_bytes": core_bytes(&evidence, &narrative, &semantic),
            "truncated": truncated.clone(),
            "dropped_events": evidence.dropped_events,
        }),
    );
    metadata.insert(
        "redaction".into(),
        json!({"applied": true, "mask": osiris_core::redact::MASK}),
    );
    metadata.insert(
        "annex".into(),
        json!({"files": annex_files.clone(), "gzip": policy.annex_gzip}),
    );

    // Assemble in canonical (alphabetical) layer order.
    let mut summary = JsonMap::new();
    summary.insert("evidence".into(), Value::Object(evidence.layer.clone()));
    summary.insert("metadata".into(), Value::Object(metadata));
    summary.insert("narrative".into(), json!(narrative));
    summary.insert("semantic".into(), Value::Object(semantic));

    let summary_path = aiop_dir.join(SUMMARY_FILE);
    write_canonical_json_file(summary_path.as_std_path(), &Value::Object(summary.clone()))
        .map_err(|e| AiopError::StdIo(e.to_string()))?;

    let run_card_path = aiop_dir.join(RUN_CARD_FILE);
    let card = render_run_card(record, &manifest, &summary);
    write_atomic(run_card_path.as_std_path(), card.as_bytes())?;

    tracing::info!(
        run = %record.run_id,
        summary = %summary_path,
        truncated = !truncated.is_empty(),
        "aiop exported"
    );

    Ok(ExportOutcome {
        aiop_dir,
        summary_path,
        run_card_path,
        annex_files,
        truncated,
    })
}

/// Core size = canonical bytes of the three content layers. The metadata
/// layer (which must reference this number) is excluded by definition.
fn core_bytes(evidence: &Evidence, narrative: &[String], semantic: &JsonMap<String, Value>) -> usize {
    let v = json!({
        "evidence": Value::Object(evidence.layer.clone()),
        "narrative": narrative,
        "semantic": Value::Object(semantic.clone()),
    });
    to_canonical_json_bytes(&v).len()
}

fn write_annex(aiop_dir: &Path, evidence: &Evidence, gzip: bool) -> Result<Vec<String>, AiopError> {
    let annex_dir = aiop_dir.join(ANNEX_DIR);
    std::fs::create_dir_all(&annex_dir)?;

    let shards: [(&str, &[Value]); 2] = [
        ("timeline.ndjson", &evidence.full_timeline),
        ("metrics.ndjson", &evidence.full_metrics),
    ];

    let mut written = Vec::new();
    for (name, values) in shards {
        let mut body = Vec::new();
        for value in values {
            body.extend_from_slice(&to_canonical_json_bytes(value));
            body.push(b'\n');
        }
        let file_name = if gzip { format!("{name}.gz") } else { name.to_owned() };
        let path = annex_dir.join(&file_name);
        if gzip {
            let file = std::fs::File::create(&path)?;
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            encoder.write_all(&body)?;
            encoder.finish()?;
        } else {
            write_atomic(&path, &body)?;
        }
        written.push(file_name);
    }
    Ok(written)
}

/// The human-readable digest next to `summary.json`. Same determinism rules:
/// every value comes from the record or the manifest.
fn render_run_card(record: &RunRecord, manifest: &Manifest, summary: &JsonMap<String, Value>) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Run {}\n\n", record.run_id));
    out.push_str(&format!(
        "- Pipeline: {} (`{}`)\n",
        manifest.pipeline.name, manifest.pipeline.id
    ));
    out.push_str(&format!("- Status: {}\n", record.status.as_str()));
    out.push_str(&format!(
        "- Manifest: `{}` ({})\n",
        record.manifest_short, record.manifest_hash
    ));
    out.push_str(&format!("- Profile: {}\n", record.profile));
    out.push_str(&format!("- Total rows: {}\n", record.total_rows));
    out.push_str(&format!("- Duration: {} ms\n", record.duration_ms));

    let delta = summary
        .get("metadata")
        .and_then(|m| m.get("delta"))
        .cloned()
        .unwrap_or(Value::Null);
    if delta.get("first_run").and_then(Value::as_bool) == Some(true) {
        out.push_str("- Delta: first run of this manifest\n");
    } else if let Some(prev) = delta.get("previous_run_id").and_then(Value::as_str) {
        out.push_str(&format!(
            "- Delta: {:+} row(s), {:+} ms vs `{prev}`\n",
            delta.get("total_rows_delta").and_then(Value::as_i64).unwrap_or(0),
            delta.get("duration_ms_delta").and_then(Value::as_i64).unwrap_or(0),
        ));
    }

    out.push_str("\n## Steps\n\n");
    out.push_str("| id | component | mode | driver |\n");
    out.push_str("|----|-----------|------|--------|\n");
    for step in &manifest.steps {
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            step.id,
            step.component,
            step.mode.as_str(),
            step.driver
        ));
    }
    out
}

/// Locate an export's summary path without exporting (CLI `aiop export
/// --last` reuse).
pub fn summary_path_for(record: &RunRecord) -> PathBuf {
    Path::new(&record.aiop_path).join(SUMMARY_FILE)
}
