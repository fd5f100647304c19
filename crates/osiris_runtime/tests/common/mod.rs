//! Shared fixtures for runtime integration tests: a two-step pipeline
//! (fixture database extractor → CSV writer) compiled against a scratch
//! engine root, with a connection whose secret comes from a test env map.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_json::{json, Value};

use osiris_compiler::{compile, CompileOptions};
use osiris_io::connections::{ConnectionResolver, ConnectionsFile};
use osiris_io::fs_contract::FilesystemContract;
use osiris_io::registry::Registry;
use osiris_runtime::ExecutionContext;

pub const DB_SPEC: &str = r#"
name: db.extractor
version: "1.0.0"
modes: [read]
configSchema:
  type: object
  properties:
    connection: {type: string}
    query: {type: string}
    table: {type: string}
    rows: {type: array}
    host: {type: string}
    password: {type: string}
secrets: ["/password"]
x-connection-fields:
  - {name: host, override: allowed}
  - {name: password, override: forbidden}
x-runtime:
  driver: memory.extractor
"#;

pub const CSV_SPEC: &str = r#"
name: csv.writer
version: "1.0.0"
modes: [write]
configSchema:
  type: object
  required: [path]
  properties:
    path: {type: string}
    delimiter: {type: string, default: ","}
    newline: {type: string, default: "lf"}
    header: {type: boolean, default: true}
x-connection-fields: []
x-runtime:
  driver: csv.writer
"#;

pub const CONNECTIONS: &str = r#"
connections:
  db:
    main:
      default: true
      host: db.internal
      password: "${DB_PASSWORD}"
"#;

pub fn three_row_oml() -> Value {
    json!({
        "oml_version": "0.1.0",
        "name": "orders-to-csv",
        "steps": [
            {"id": "extract", "component": "db.extractor", "mode": "read",
             "config": {"table": "orders",
                        "rows": [{"id": 1}, {"id": 2}, {"id": 3}]}},
            {"id": "write", "component": "csv.writer", "mode": "write",
             "config": {"path": "out.csv"},
             "inputs": {"df": "${extract.df}"}}
        ]
    })
}

pub struct Fixture {
    pub ctx: ExecutionContext,
    pub manifest_path: Utf8PathBuf,
    pub manifest_hash: String,
}

/// Compile the fixture pipeline under `root` and build an execution context
/// whose env supplies the connection secret.
pub fn fixture(root: &Path) -> Fixture {
    let components = root.join("components");
    std::fs::create_dir_all(&components).unwrap();
    std::fs::write(components.join("db.extractor.yaml"), DB_SPEC).unwrap();
    std::fs::write(components.join("csv.writer.yaml"), CSV_SPEC).unwrap();

    let registry = Arc::new(Registry::load(&components).unwrap());
    let file: ConnectionsFile = serde_yaml::from_str(CONNECTIONS).unwrap();
    let resolver = Arc::new(ConnectionResolver::new(file));
    let fsc = FilesystemContract::from_std_path(&root.join("engine")).unwrap();

    let opts = CompileOptions {
        profile: None,
        generated_at: "2025-08-01T12:00:00Z".into(),
    };
    let compiled = compile(&three_row_oml(), &registry, &resolver, &fsc, &opts).unwrap();

    let env: BTreeMap<String, String> =
        [("DB_PASSWORD".to_string(), "sw0rdfish".to_string())].into_iter().collect();

    Fixture {
        ctx: ExecutionContext {
            fsc,
            registry,
            drivers: Arc::new(osiris_drivers::builtin_registry()),
            resolver,
            env: Arc::new(env),
        },
        manifest_path: compiled.manifest_path,
        manifest_hash: compiled.hash.as_hex().to_owned(),
    }
}

/// Parse a JSONL file into values.
pub fn read_jsonl(path: &Utf8PathBuf) -> Vec<Value> {
    std::fs::read_to_string(path.as_std_path())
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

/// Multiset of event kinds in emission order.
pub fn event_kinds(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["event"].as_str().unwrap().to_owned())
        .collect()
}
