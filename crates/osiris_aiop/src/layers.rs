//! Layer builders: evidence, semantic, narrative.
//!
//! Builders are pure functions of already-loaded inputs. Evidence ids
//! (`ev.<n>`) are assigned over the density-filtered timeline in file order,
//! so identical inputs yield identical ids and identical citations.

use std::collections::BTreeMap;

use serde_json::{json, Map as JsonMap, Value};

use osiris_compiler::manifest::Manifest;
use osiris_io::hasher::sha256_file;
use osiris_io::registry::Registry;

use crate::policy::{AiopPolicy, SchemaMode, TimelineDensity};
use crate::AiopError;

/// Evidence layer plus the cross-references the narrative needs.
pub struct Evidence {
    pub layer: JsonMap<String, Value>,
    /// Unfiltered timeline (annex source).
    pub full_timeline: Vec<Value>,
    /// Unfiltered metrics (annex source).
    pub full_metrics: Vec<Value>,
    /// step id → evidence ids of its step_complete entries.
    pub step_completions: BTreeMap<String, String>,
    /// Evidence id of the cleanup_complete entry, if in the timeline.
    pub cleanup_id: Option<String>,
    /// Evidence ids of step_failed entries.
    pub error_ids: Vec<String>,
    /// Events dropped by density filtering.
    pub dropped_events: usize,
}

fn included(kind: &str, density: TimelineDensity) -> bool {
    let minimal = matches!(kind, "run_start" | "step_failed" | "cleanup_complete" | "run_end");
    match density {
        TimelineDensity::Minimal => minimal,
        TimelineDensity::Medium => {
            minimal
                || matches!(
                    kind,
                    "step_start"
                        | "step_complete"
                        | "cancel_requested"
                        | "sandbox_bootstrap_start"
                        | "sandbox_bootstrap_complete"
                )
        }
        TimelineDensity::Verbose => true,
    }
}

/// Read a JSONL file into values, skipping unparsable lines (same tolerance
/// as the run-index reader).
pub fn read_jsonl(path: &std::path::Path) -> Result<Vec<Value>, AiopError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

pub fn build_evidence(
    events: Vec<Value>,
    metrics: Vec<Value>,
    artifacts_dir: &std::path::Path,
    policy: &AiopPolicy,
) -> Result<Evidence, AiopError> {
    // Timeline: filter by density, then assign ids over the filtered list.
    let mut timeline = Vec::new();
    let mut step_completions = BTreeMap::new();
    let mut cleanup_id = None;
    let mut error_ids = Vec::new();
    let mut dropped_events = 0usize;

    for event in &events {
        let kind = event.get("event").and_then(Value::as_str).unwrap_or_default();
        if !included(kind, policy.timeline_density) {
            dropped_events += 1;
            continue;
        }
        let id = format!("ev.{}", timeline.len());
        match kind {
            "step_complete" => {
                if let Some(step) = event.get("step_id").and_then(Value::as_str) {
                    step_completions.insert(step.to_owned(), id.clone());
                }
            }
            "cleanup_complete" => cleanup_id = Some(id.clone()),
            "step_failed" => error_ids.push(id.clone()),
            _ => {}
        }
        let mut entry = JsonMap::new();
        entry.insert("id".into(), json!(id));
        if let Some(obj) = event.as_object() {
            for (k, v) in obj {
                entry.insert(k.clone(), v.clone());
            }
        }
        timeline.push(Value::Object(entry));
    }

    // Metrics: top-K per step by value (desc), name then file order breaking
    // ties; unscoped metrics group under "".
    let mut by_step: BTreeMap<String, Vec<&Value>> = BTreeMap::new();
    for metric in &metrics {
        let step = metric
            .pointer("/tags/step")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        by_step.entry(step).or_default().push(metric);
    }
    let mut metrics_layer = JsonMap::new();
    let mut dropped_metrics = 0usize;
    for (step, mut entries) in by_step {
        entries.sort_by(|a, b| {
            let av = a.get("value").and_then(Value::as_f64).unwrap_or(0.0);
            let bv = b.get("value").and_then(Value::as_f64).unwrap_or(0.0);
            bv.partial_cmp(&av)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let an = a.get("metric").and_then(Value::as_str).unwrap_or("");
                    let bn = b.get("metric").and_then(Value::as_str).unwrap_or("");
                    an.cmp(bn)
                })
        });
        if entries.len() > policy.metrics_topk {
            dropped_metrics += entries.len() - policy.metrics_topk;
            entries.truncate(policy.metrics_topk);
        }
        metrics_layer.insert(step, Value::Array(entries.into_iter().cloned().collect()));
    }

    // Errors: full step_failed payloads (already redacted at emission).
    let errors: Vec<Value> = events
        .iter()
        .filter(|e| e.get("event").and_then(Value::as_str) == Some("step_failed"))
        .cloned()
        .collect();

    // Artifacts: references only (path, size, digest), never raw bytes.
    let artifacts = artifact_refs(artifacts_dir)?;

    let mut layer = JsonMap::new();
    layer.insert("timeline".into(), Value::Array(timeline));
    layer.insert(
        "metrics".into(),
        json!({"by_step": Value::Object(metrics_layer), "dropped": dropped_metrics}),
    );
    layer.insert("errors".into(), Value::Array(errors));
    layer.insert("artifacts".into(), Value::Array(artifacts));

    Ok(Evidence {
        layer,
        full_timeline: events,
        full_metrics: metrics,
        step_completions,
        cleanup_id,
        error_ids,
        dropped_events,
    })
}

fn artifact_refs(artifacts_dir: &std::path::Path) -> Result<Vec<Value>, AiopError> {
    let mut refs = Vec::new();
    let mut stack = vec![artifacts_dir.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    for path in files {
        let relative = path
            .strip_prefix(artifacts_dir)
            .map_err(|_| AiopError::Input(format!("artifact outside tree: {}", path.display())))?;
        let mut components = relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned());
        let step_id = components.next().unwrap_or_default();
        let name = components.collect::<Vec<_>>().join("/");
        let size = std::fs::metadata(&path)?.len();
        let digest = sha256_file(&path)?;
        refs.push(json!({
            "step_id": step_id,
            "name": name,
            "path": path.to_string_lossy(),
            "size_bytes": size,
            "sha256": digest,
        }));
    }
    Ok(refs)
}

/// Semantic layer: the DAG, the pipeline identity, and component metadata.
pub fn build_semantic(
    manifest: &Manifest,
    registry: Option<&Registry>,
    schema_mode: SchemaMode,
) -> JsonMap<String, Value> {
    let nodes: Vec<Value> = manifest
        .steps
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "component": s.component,
                "mode": s.mode,
                "driver": s.driver,
            })
        })
        .collect();
    let mut edges = Vec::new();
    for step in &manifest.steps {
        for dep in &step.needs {
            edges.push(json!({"from": dep, "to": step.id}));
        }
    }

    let mut components = JsonMap::new();
    let mut names: Vec<&str> = manifest.steps.iter().map(|s| s.component.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    for name in names {
        let mut meta = JsonMap::new();
        if let Some(cached) = registry.and_then(|r| r.get(name).ok()) {
            meta.insert("version".into(), json!(cached.spec.version));
            meta.insert("modes".into(), json!(cached.spec.modes));
            if schema_mode == SchemaMode::Full {
                meta.insert("configSchema".into(), cached.spec.config_schema.clone());
            }
        }
        components.insert(name.to_owned(), Value::Object(meta));
    }

    let mut layer = JsonMap::new();
    layer.insert("dag".into(), json!({"nodes": nodes, "edges": edges}));
    layer.insert(
        "pipeline".into(),
        json!({
            "id": manifest.pipeline.id,
            "name": manifest.pipeline.name,
            "profile": manifest.meta.profile,
            "oml_version": manifest.meta.oml_version,
            "generated_at": manifest.meta.generated_at,
        }),
    );
    layer.insert("components".into(), Value::Object(components));
    layer
}

/// Narrative layer: deterministic prose, each claim citing evidence ids.
pub fn build_narrative(
    manifest: &Manifest,
    record_status: &str,
    total_rows: u64,
    duration_ms: u64,
    evidence: &Evidence,
) -> Vec<String> {
    let mut sentences = Vec::new();
    sentences.push(format!(
        "Pipeline '{}' {} after {} ms, moving {} row(s) in total{}.",
        manifest.pipeline.name,
        record_status,
        duration_ms,
        total_rows,
        evidence
            .cleanup_id
            .as_deref()
            .map(|id| format!(" [{id}]"))
            .unwrap_or_default(),
    ));

    for step in &manifest.steps {
        if let Some(ev) = evidence.step_completions.get(&step.id) {
            sentences.push(format!(
                "Step '{}' ({}, {}) completed [{ev}].",
                step.id,
                step.component,
                step.mode.as_str(),
            ));
        }
    }

    if !evidence.error_ids.is_empty() {
        let cites = evidence
            .error_ids
            .iter()
            .map(|id| format!("[{id}]"))
            .collect::<Vec<_>>()
            .join(" ");
        sentences.push(format!("The run recorded {} failure(s) {cites}.", evidence.error_ids.len()));
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> Vec<Value> {
        vec![
            json!({"ts": "t0", "session": "s", "event": "run_start", "pipeline_id": "p", "manifest_hash": "h"}),
            json!({"ts": "t1", "session": "s", "event": "step_start", "step_id": "a", "driver": "d"}),
            json!({"ts": "t2", "session": "s", "event": "connection_resolve_start", "step_id": "a", "connection": "@x.y"}),
            json!({"ts": "t3", "session": "s", "event": "step_complete", "step_id": "a", "rows_processed": 3, "duration_ms": 5}),
            json!({"ts": "t4", "session": "s", "event": "cleanup_complete", "total_rows": 3, "duration_ms": 9}),
            json!({"ts": "t5", "session": "s", "event": "run_end", "status": "completed"}),
        ]
    }

    #[test]
    fn density_filters_and_ids_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let policy = AiopPolicy::default(); // medium
        let ev = build_evidence(events(), vec![], dir.path(), &policy).unwrap();
        let timeline = ev.layer["timeline"].as_array().unwrap();
        // connection_resolve_start filtered at medium density.
        assert_eq!(timeline.len(), 5);
        assert_eq!(ev.dropped_events, 1);
        assert_eq!(timeline[0]["id"], "ev.0");
        assert_eq!(ev.step_completions["a"], "ev.2");
        assert_eq!(ev.cleanup_id.as_deref(), Some("ev.3"));

        let minimal = AiopPolicy { timeline_density: TimelineDensity::Minimal, ..policy };
        let ev = build_evidence(events(), vec![], dir.path(), &minimal).unwrap();
        assert_eq!(ev.layer["timeline"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn metrics_topk_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = vec![
            json!({"ts": "t", "metric": "rows_read", "value": 3, "unit": "rows", "tags": {"step": "a"}}),
            json!({"ts": "t", "metric": "batch_ms", "value": 9, "unit": "ms", "tags": {"step": "a"}}),
            json!({"ts": "t", "metric": "files", "value": 1, "unit": "files", "tags": {"step": "b"}}),
        ];
        let policy = AiopPolicy { metrics_topk: 1, ..AiopPolicy::default() };
        let ev = build_evidence(vec![], metrics, dir.path(), &policy).unwrap();
        let by_step = ev.layer["metrics"]["by_step"].as_object().unwrap();
        assert_eq!(by_step["a"].as_array().unwrap().len(), 1);
        assert_eq!(by_step["a"][0]["metric"], "batch_ms"); // larger value wins
        assert_eq!(ev.layer["metrics"]["dropped"], 1);
    }
}
