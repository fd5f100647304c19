//! End-to-end local execution: the three-row fixture pipeline through
//! prepare → execute → collect, checked at the observation layer (events,
//! metrics, artifact bytes, run record).

mod common;

use common::{event_kinds, fixture, read_jsonl};

use osiris_io::run_index::{RunIndexReader, RunStatus};
use osiris_runtime::ExecutionAdapter;

#[test]
fn happy_path_three_rows() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path());

    let collected = ExecutionAdapter::Local.run(&fx.manifest_path, &fx.ctx).unwrap();
    let record = &collected.record;

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.total_rows, 3);
    assert_eq!(record.manifest_hash, fx.manifest_hash);
    assert_eq!(record.manifest_hash.len(), 64);
    assert!(!record.manifest_hash.contains(':'));
    assert!(!record.ended_at.is_empty());

    // Artifact bytes are exactly the sorted-column CSV.
    let out = std::fs::read(collected.artifacts_dir.join("write/out.csv").as_std_path()).unwrap();
    assert_eq!(out, b"id\n1\n2\n3\n");

    // One step_start + step_complete per step, in DAG order.
    let events = read_jsonl(&collected.events_path);
    let kinds = event_kinds(&events);
    assert_eq!(kinds.iter().filter(|k| *k == "step_start").count(), 2);
    assert_eq!(kinds.iter().filter(|k| *k == "step_complete").count(), 2);
    assert_eq!(kinds.first().map(String::as_str), Some("run_start"));
    assert_eq!(kinds.last().map(String::as_str), Some("run_end"));
    let extract_start = kinds.iter().position(|k| k == "step_start").unwrap();
    assert_eq!(events[extract_start]["step_id"], "extract");

    // cleanup_complete carries the authoritative total.
    let cleanup = events.iter().find(|e| e["event"] == "cleanup_complete").unwrap();
    assert_eq!(cleanup["total_rows"], 3);

    // Required row metrics, step-tagged.
    let metrics = read_jsonl(&collected.metrics_path);
    let rows_read = metrics.iter().find(|m| m["metric"] == "rows_read").unwrap();
    assert_eq!(rows_read["value"], 3);
    assert_eq!(rows_read["tags"]["step"], "extract");
    let rows_written = metrics.iter().find(|m| m["metric"] == "rows_written").unwrap();
    assert_eq!(rows_written["value"], 3);
    assert_eq!(rows_written["tags"]["step"], "write");

    // The run is findable through the index, pure-hex filename included.
    let reader = RunIndexReader::new(&fx.ctx.fsc);
    let listed = reader.list_all().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].run_id, record.run_id);
    let by_manifest = fx.ctx.fsc.by_manifest_index_path(&fx.manifest_hash.parse().unwrap());
    let fname = by_manifest.file_name().unwrap();
    assert!(fname.chars().all(|c| c.is_ascii_hexdigit() || c == '.'), "{fname}");
}

#[test]
fn no_secret_bytes_anywhere() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path());
    let collected = ExecutionAdapter::Local.run(&fx.manifest_path, &fx.ctx).unwrap();

    // The resolved password must appear in no manifest, config, event,
    // metric, or index file.
    let mut paths = vec![
        fx.manifest_path.clone(),
        collected.events_path.clone(),
        collected.metrics_path.clone(),
        fx.ctx.fsc.runs_index_path(),
    ];
    let steps_dir = fx.manifest_path.parent().unwrap().join("steps");
    for entry in std::fs::read_dir(steps_dir.as_std_path()).unwrap() {
        let p = entry.unwrap().path();
        paths.push(camino::Utf8PathBuf::from_path_buf(p).unwrap());
    }
    for path in paths {
        let text = std::fs::read_to_string(path.as_std_path()).unwrap();
        assert!(!text.contains("sw0rdfish"), "secret leaked into {path}");
    }
}

#[test]
fn failed_step_still_collects() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path());

    // Break the extractor config after compile: rows must be an array.
    let steps_dir = fx.manifest_path.parent().unwrap().join("steps");
    let extract_cfg = steps_dir.join("extract.yaml");
    let text = std::fs::read_to_string(extract_cfg.as_std_path()).unwrap();
    std::fs::write(
        extract_cfg.as_std_path(),
        text.replace("rows:", "rows_disabled:"),
    )
    .unwrap();

    // The tampered config changes the manifest fingerprint target files, so
    // prepare's integrity check still passes (only the manifest is hashed);
    // the driver fails at execute time instead.
    let collected = ExecutionAdapter::Local.run(&fx.manifest_path, &fx.ctx).unwrap();
    let record = &collected.record;
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.total_rows, 0);
    assert!(!record.ended_at.is_empty());

    let events = read_jsonl(&collected.events_path);
    let kinds = event_kinds(&events);
    assert!(kinds.contains(&"step_failed".to_string()));
    // Fail-fast: the writer never started.
    assert_eq!(kinds.iter().filter(|k| *k == "step_start").count(), 1);
    // The run still closed in order.
    assert_eq!(kinds.last().map(String::as_str), Some("run_end"));
    let failed = events.iter().find(|e| e["event"] == "step_failed").unwrap();
    assert_eq!(failed["step_id"], "extract");
    assert_eq!(failed["error_type"], "config");
}

#[test]
fn unknown_driver_fails_prepare() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path());

    // A context whose driver registry lacks the writer driver.
    let mut drivers = osiris_core::driver::DriverRegistry::new();
    drivers
        .register(
            osiris_drivers::MEMORY_EXTRACTOR,
            std::sync::Arc::new(osiris_drivers::MemoryExtractorDriver),
        )
        .unwrap();
    let ctx = osiris_runtime::ExecutionContext {
        drivers: std::sync::Arc::new(drivers),
        fsc: fx.ctx.fsc.clone(),
        registry: std::sync::Arc::clone(&fx.ctx.registry),
        resolver: std::sync::Arc::clone(&fx.ctx.resolver),
        env: std::sync::Arc::clone(&fx.ctx.env),
    };

    let err = ExecutionAdapter::Local.prepare(&fx.manifest_path, &ctx).unwrap_err();
    assert!(matches!(err, osiris_runtime::ExecError::UnknownDriver(name) if name == "csv.writer"));
    // Nothing was recorded for the aborted run.
    assert!(RunIndexReader::new(&ctx.fsc).list_all().unwrap().is_empty());
}
