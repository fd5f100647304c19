//! `csv.writer`: deterministic CSV materialization.
//!
//! Byte-reproducibility rules:
//! - Columns are the sorted union of row keys; order never depends on row
//!   insertion order.
//! - The record terminator comes from the `newline` config ("lf" | "crlf").
//! - Cell rendering is locale-free: strings verbatim, numbers via their JSON
//!   scalar form, booleans as true/false, null as the empty cell, and
//!   structured values as compact JSON.

use serde_json::{Map as JsonMap, Number, Value};

use osiris_core::driver::{Driver, DriverError, DriverRequest};
use osiris_core::events::{MetricUnit, METRIC_ROWS_WRITTEN};
use osiris_core::table::StepOutputs;

/// Default logical input name for tabular data.
pub const DEFAULT_INPUT: &str = "df";

pub struct CsvWriterDriver;

impl Driver for CsvWriterDriver {
    fn run(&self, req: DriverRequest<'_>) -> Result<StepOutputs, DriverError> {
        let path_cfg = req
            .config
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Config("csv.writer requires 'path'".into()))?;
        let delimiter = match req.config.get("delimiter").and_then(Value::as_str).unwrap_or(",") {
            d if d.len() == 1 => d.as_bytes()[0],
            other => return Err(DriverError::Config(format!("delimiter must be one byte, got '{other}'"))),
        };
        let terminator = match req.config.get("newline").and_then(Value::as_str).unwrap_or("lf") {
            "lf" => csv::Terminator::Any(b'\n'),
            "crlf" => csv::Terminator::CRLF,
            other => return Err(DriverError::Config(format!("newline must be 'lf' or 'crlf', got '{other}'"))),
        };
        let header = req.config.get("header").and_then(Value::as_bool).unwrap_or(true);
        let input_name = req.config.get("input").and_then(Value::as_str).unwrap_or(DEFAULT_INPUT);

        let table = req
            .inputs
            .get(input_name)
            .ok_or_else(|| DriverError::MissingInput(input_name.to_owned()))?;

        // Relative paths are session artifacts; absolute paths are written
        // where they point (still through atomic create).
        let target = if std::path::Path::new(path_cfg).is_absolute() {
            std::path::PathBuf::from(path_cfg)
        } else {
            req.ctx.artifact_path(path_cfg)?
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let columns = table.columns();
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .terminator(terminator)
            .from_path(&target)
            .map_err(|e| DriverError::Io(e.to_string()))?;

        if header {
            writer
                .write_record(&columns)
                .map_err(|e| DriverError::Io(e.to_string()))?;
        }
        for row in table.rows() {
            if req.ctx.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            let record: Vec<String> = columns.iter().map(|c| render_cell(row.get(c))).collect();
            writer
                .write_record(&record)
                .map_err(|e| DriverError::Io(e.to_string()))?;
        }
        writer.flush().map_err(|e| DriverError::Io(e.to_string()))?;

        let mut tags = JsonMap::new();
        tags.insert("step".into(), Value::String(req.step_id.to_string()));
        req.ctx.log_metric(
            METRIC_ROWS_WRITTEN,
            Number::from(table.len() as u64),
            MetricUnit::Rows,
            tags,
        );

        Ok(StepOutputs::new())
    }
}

fn render_cell(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => serde_json::to_string(other).expect("JSON value serialization cannot fail"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestCtx;
    use osiris_core::table::{StepInputs, Table};
    use serde_json::json;
    use std::sync::Arc;

    fn run_writer(config: serde_json::Map<String, Value>, rows: Vec<Value>, ctx: &TestCtx) {
        let table = Table::from_values(rows).unwrap();
        let mut inputs = StepInputs::new();
        inputs.insert("df".into(), Arc::new(table));
        let step = "write".parse().unwrap();
        CsvWriterDriver
            .run(DriverRequest { step_id: &step, config: &config, inputs: &inputs, ctx })
            .unwrap();
    }

    #[test]
    fn writes_expected_bytes_for_single_column() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TestCtx::with_artifacts(dir.path().to_path_buf());
        let config = json!({"path": "out.csv"}).as_object().unwrap().clone();
        run_writer(config, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})], &ctx);

        let bytes = std::fs::read(dir.path().join("out.csv")).unwrap();
        assert_eq!(bytes, b"id\n1\n2\n3\n");
        let (value, tags) = ctx.metric(METRIC_ROWS_WRITTEN).unwrap();
        assert_eq!(value.as_u64(), Some(3));
        assert_eq!(tags["step"], "write");
    }

    #[test]
    fn columns_are_sorted_and_missing_cells_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TestCtx::with_artifacts(dir.path().to_path_buf());
        let config = json!({"path": "out.csv"}).as_object().unwrap().clone();
        run_writer(
            config,
            vec![json!({"b": "x", "a": 1}), json!({"a": 2, "c": true})],
            &ctx,
        );
        let text = std::fs::read_to_string(dir.path().join("out.csv")).unwrap();
        assert_eq!(text, "a,b,c\n1,x,\n2,,true\n");
    }

    #[test]
    fn crlf_mapping_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TestCtx::with_artifacts(dir.path().to_path_buf());
        let config = json!({"path": "out.csv", "newline": "crlf"}).as_object().unwrap().clone();
        run_writer(config, vec![json!({"id": 1})], &ctx);
        let bytes = std::fs::read(dir.path().join("out.csv")).unwrap();
        assert_eq!(bytes, b"id\r\n1\r\n");
    }

    #[test]
    fn missing_input_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TestCtx::with_artifacts(dir.path().to_path_buf());
        let config = json!({"path": "out.csv"}).as_object().unwrap().clone();
        let step = "write".parse().unwrap();
        let inputs = StepInputs::new();
        let err = CsvWriterDriver
            .run(DriverRequest { step_id: &step, config: &config, inputs: &inputs, ctx: &ctx })
            .unwrap_err();
        assert!(matches!(err, DriverError::MissingInput(name) if name == "df"));
    }
}
