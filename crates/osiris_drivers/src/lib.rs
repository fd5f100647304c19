//! crates/osiris_drivers/src/lib.rs
//! Built-in drivers. These are the deterministic, dependency-free end of the
//! driver spectrum: enough to compile, run, and test whole pipelines without
//! any external connector. Real connectors live outside the engine and
//! implement the same `Driver` contract.
//!
//! Every driver here:
//! - validates its config explicitly (schema validation already ran upstream;
//!   these checks guard direct embedders),
//! - emits its mode-appropriate row metric tagged with the step id,
//! - never mutates its inputs.

#![forbid(unsafe_code)]

use std::sync::Arc;

use osiris_core::driver::DriverRegistry;

pub mod csv_writer;
pub mod memory;
pub mod transform;

pub use csv_writer::CsvWriterDriver;
pub use memory::MemoryExtractorDriver;
pub use transform::RowsTransformDriver;

/// Driver registry keys for the built-ins.
pub const MEMORY_EXTRACTOR: &str = "memory.extractor";
pub const CSV_WRITER: &str = "csv.writer";
pub const ROWS_TRANSFORM: &str = "rows.transform";

/// A registry with every built-in driver wired. Callers extend it with
/// connector drivers before handing it to the runtime.
pub fn builtin_registry() -> DriverRegistry {
    let mut reg = DriverRegistry::new();
    // Registration happens exactly once per process; duplicates here would be
    // a programming error, so the unwraps are safe by construction.
    reg.register(MEMORY_EXTRACTOR, Arc::new(MemoryExtractorDriver)).expect("fresh registry");
    reg.register(CSV_WRITER, Arc::new(CsvWriterDriver)).expect("fresh registry");
    reg.register(ROWS_TRANSFORM, Arc::new(RowsTransformDriver)).expect("fresh registry");
    reg
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A minimal in-memory `RunContext` for driver unit tests.

    use std::path::PathBuf;
    use std::sync::Mutex;

    use serde_json::{Map as JsonMap, Number, Value};

    use osiris_core::driver::{DriverError, RunContext};
    use osiris_core::events::{EventKind, MetricUnit};

    #[derive(Default)]
    pub struct TestCtx {
        pub artifacts_root: PathBuf,
        pub events: Mutex<Vec<(EventKind, JsonMap<String, Value>)>>,
        pub metrics: Mutex<Vec<(String, Number, MetricUnit, JsonMap<String, Value>)>>,
    }

    impl TestCtx {
        pub fn with_artifacts(root: PathBuf) -> Self {
            TestCtx { artifacts_root: root, ..TestCtx::default() }
        }

        pub fn metric(&self, name: &str) -> Option<(Number, JsonMap<String, Value>)> {
            self.metrics
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _, _, _)| n == name)
                .map(|(_, v, _, tags)| (v.clone(), tags.clone()))
        }
    }

    impl RunContext for TestCtx {
        fn log_event(&self, kind: EventKind, payload: JsonMap<String, Value>) {
            self.events.lock().unwrap().push((kind, payload));
        }

        fn log_metric(&self, name: &str, value: Number, unit: MetricUnit, tags: JsonMap<String, Value>) {
            self.metrics.lock().unwrap().push((name.to_owned(), value, unit, tags));
        }

        fn artifact_path(&self, logical_name: &str) -> Result<PathBuf, DriverError> {
            let path = self.artifacts_root.join(logical_name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(path)
        }

        fn is_cancelled(&self) -> bool {
            false
        }
    }
}
