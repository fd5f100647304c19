//! AIOP export properties over a hand-built run directory: byte-identical
//! re-export, first-run/delta semantics, annex policy, truncation ladder.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use osiris_aiop::policy::PolicyOverrides;
use osiris_aiop::{export, AiopPolicy, ExportInputs, ExportPolicy};
use osiris_compiler::{compile, CompileOptions};
use osiris_core::ids::RunId;
use osiris_io::connections::{ConnectionResolver, ConnectionsFile};
use osiris_io::fs_contract::FilesystemContract;
use osiris_io::registry::Registry;
use osiris_io::run_index::{RunIndexWriter, RunRecord, RunStatus};

const SPEC: &str = r#"
name: db.extractor
version: "1.0.0"
modes: [read]
configSchema:
  type: object
  properties:
    table: {type: string}
    rows: {type: array}
x-connection-fields: []
x-runtime:
  driver: memory.extractor
"#;

struct Setup {
    fsc: FilesystemContract,
    registry: Arc<Registry>,
    hash: String,
}

fn setup(root: &Path) -> Setup {
    let components = root.join("components");
    std::fs::create_dir_all(&components).unwrap();
    std::fs::write(components.join("db.extractor.yaml"), SPEC).unwrap();
    let registry = Arc::new(Registry::load(&components).unwrap());
    let resolver = ConnectionResolver::new(ConnectionsFile::default());
    let fsc = FilesystemContract::from_std_path(&root.join("engine")).unwrap();

    let oml = json!({
        "oml_version": "0.1.0",
        "name": "orders",
        "steps": [
            {"id": "extract", "component": "db.extractor", "mode": "read",
             "config": {"table": "orders", "rows": [{"id": 1}]}}
        ]
    });
    let opts = CompileOptions { profile: None, generated_at: "2025-08-01T12:00:00Z".into() };
    let compiled = compile(&oml, &registry, &resolver, &fsc, &opts).unwrap();

    Setup { fsc, registry, hash: compiled.hash.as_hex().to_owned() }
}

/// Fabricate a completed run: session files with fixed timestamps plus the
/// appended index record.
fn record_run(s: &Setup, run_id: &str, total_rows: u64, seq: u64) -> RunRecord {
    let run: RunId = run_id.parse().unwrap();
    std::fs::create_dir_all(s.fsc.artifacts_dir(&run).as_std_path()).unwrap();

    let events = [
        json!({"ts": "2025-08-01T12:00:00.000Z", "session": run_id, "event": "run_start",
               "pipeline_id": "orders", "manifest_hash": s.hash}),
        json!({"ts": "2025-08-01T12:00:00.100Z", "session": run_id, "event": "step_start",
               "step_id": "extract", "driver": "memory.extractor"}),
        json!({"ts": "2025-08-01T12:00:00.200Z", "session": run_id, "event": "step_complete",
               "step_id": "extract", "rows_processed": total_rows, "duration_ms": 100}),
        json!({"ts": "2025-08-01T12:00:00.300Z", "session": run_id, "event": "cleanup_complete",
               "total_rows": total_rows, "duration_ms": 300}),
        json!({"ts": "2025-08-01T12:00:00.400Z", "session": run_id, "event": "run_end",
               "status": "completed"}),
    ];
    let body: String = events.iter().map(|e| format!("{e}\n")).collect();
    std::fs::write(s.fsc.events_path(&run).as_std_path(), body).unwrap();

    let metrics = json!({"ts": "2025-08-01T12:00:00.200Z", "session": run_id,
                         "metric": "rows_read", "value": total_rows, "unit": "rows",
                         "tags": {"step": "extract"}});
    std::fs::write(s.fsc.metrics_path(&run).as_std_path(), format!("{metrics}\n")).unwrap();

    let slug = "orders".parse().unwrap();
    let hash = s.hash.parse().unwrap();
    let record = RunRecord {
        run_id: run.clone(),
        pipeline_slug: slug,
        manifest_hash: s.hash.clone(),
        manifest_short: s.hash[..7].to_owned(),
        profile: "default".into(),
        started_at: "2025-08-01T12:00:00Z".into(),
        ended_at: "2025-08-01T12:00:01Z".into(),
        status: RunStatus::Completed,
        duration_ms: 1000,
        total_rows,
        aiop_path: s.fsc.aiop_run_dir("default", &"orders".parse().unwrap(), &hash, seq, &run).to_string(),
        artifacts_path: s.fsc.artifacts_dir(&run).to_string(),
    };
    RunIndexWriter::new(&s.fsc).append(&record).unwrap();
    record
}

#[test]
fn reexport_is_byte_identical_and_first_run_true() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path());
    let record = record_run(&s, "run_20250801T120000Z_aaaaaa", 3, 1);

    let inputs = ExportInputs { fsc: &s.fsc, record: &record, registry: Some(&s.registry) };
    let policy = AiopPolicy::default();

    let first = export(&inputs, &policy).unwrap();
    let bytes1 = std::fs::read(first.summary_path.as_std_path()).unwrap();
    let second = export(&inputs, &policy).unwrap();
    let bytes2 = std::fs::read(second.summary_path.as_std_path()).unwrap();
    assert_eq!(bytes1, bytes2, "re-export must be byte-identical");

    let summary: Value = serde_json::from_slice(&bytes1).unwrap();
    assert_eq!(summary["metadata"]["delta"]["first_run"], true);
    assert_eq!(summary["metadata"]["manifest_hash"], s.hash);
    assert!(!s.hash.contains(':'));
    // Narrative cites evidence ids that exist in the timeline.
    let narrative = summary["narrative"].as_array().unwrap();
    assert!(narrative[0].as_str().unwrap().contains("[ev."));
    assert!(first.truncated.is_empty());
}

#[test]
fn second_run_delta_references_the_first() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path());
    let first = record_run(&s, "run_20250801T120000Z_aaaaaa", 3, 1);
    let second = record_run(&s, "run_20250801T130000Z_bbbbbb", 5, 2);

    let inputs = ExportInputs { fsc: &s.fsc, record: &second, registry: Some(&s.registry) };
    let outcome = export(&inputs, &AiopPolicy::default()).unwrap();
    let summary: Value =
        serde_json::from_slice(&std::fs::read(outcome.summary_path.as_std_path()).unwrap()).unwrap();

    let delta = &summary["metadata"]["delta"];
    assert_eq!(delta["first_run"], false);
    assert_eq!(delta["previous_run_id"], first.run_id.as_str());
    assert_eq!(delta["total_rows_delta"], 2);

    // The by-manifest index filename is pure hex.
    let path = s.fsc.by_manifest_index_path(&s.hash.parse().unwrap());
    let fname = path.file_name().unwrap();
    assert!(!fname.contains(':'));
    assert!(fname.trim_end_matches(".jsonl").chars().all(|c| c.is_ascii_hexdigit()));

    // The older run still reports first_run == true when exported later.
    let inputs = ExportInputs { fsc: &s.fsc, record: &first, registry: Some(&s.registry) };
    let outcome = export(&inputs, &AiopPolicy::default()).unwrap();
    let summary: Value =
        serde_json::from_slice(&std::fs::read(outcome.summary_path.as_std_path()).unwrap()).unwrap();
    assert_eq!(summary["metadata"]["delta"]["first_run"], true);
}

#[test]
fn annex_policy_writes_shards() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path());
    let record = record_run(&s, "run_20250801T120000Z_aaaaaa", 3, 1);

    let policy = AiopPolicy::resolve(
        &PolicyOverrides { policy: Some(ExportPolicy::Annex), ..PolicyOverrides::default() },
        &|_| None,
        None,
    );
    let inputs = ExportInputs { fsc: &s.fsc, record: &record, registry: Some(&s.registry) };
    let outcome = export(&inputs, &policy).unwrap();

    assert_eq!(outcome.annex_files, vec!["timeline.ndjson", "metrics.ndjson"]);
    let annex = outcome.aiop_dir.join("annex");
    let timeline = std::fs::read_to_string(annex.join("timeline.ndjson").as_std_path()).unwrap();
    // Full, unfiltered stream: every event line, one JSON object per line.
    assert_eq!(timeline.lines().count(), 5);
    for line in timeline.lines() {
        serde_json::from_str::<Value>(line).unwrap();
    }
}

#[test]
fn tiny_core_budget_truncates_with_markers() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path());
    let record = record_run(&s, "run_20250801T120000Z_aaaaaa", 3, 1);

    let policy = AiopPolicy { max_core_bytes: 64, ..AiopPolicy::default() };
    let inputs = ExportInputs { fsc: &s.fsc, record: &record, registry: Some(&s.registry) };
    let outcome = export(&inputs, &policy).unwrap();

    assert!(!outcome.truncated.is_empty());
    assert!(outcome.truncated.contains(&"timeline_minimal".to_string()));
    // Truncation spills the full data to the annex.
    assert!(!outcome.annex_files.is_empty());

    let summary: Value =
        serde_json::from_slice(&std::fs::read(outcome.summary_path.as_std_path()).unwrap()).unwrap();
    let markers = summary["metadata"]["size"]["truncated"].as_array().unwrap();
    assert!(!markers.is_empty());
}
