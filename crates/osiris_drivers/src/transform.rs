//! `rows.transform`: declarative in-memory row transforms.
//!
//! Operations (applied in this fixed order, each optional):
//!   1. `drop`:    [column, ...]         remove columns
//!   2. `select`:  [column, ...]         keep only these columns, in sorted output
//!   3. `rename`:  {old: new, ...}       rename columns
//!   4. `sort_by`: [column, ...]         stable sort by the named columns
//!   5. `limit`:   N                     keep the first N rows
//!
//! All comparisons use a total, type-ranked ordering over JSON values so a
//! sort never depends on platform float formatting.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Number, Value};

use osiris_core::driver::{Driver, DriverError, DriverRequest};
use osiris_core::events::{MetricUnit, METRIC_ROWS_PROCESSED};
use osiris_core::table::{StepOutputs, Table};

pub const DEFAULT_INPUT: &str = "df";
pub const DEFAULT_OUTPUT: &str = "df";

pub struct RowsTransformDriver;

impl Driver for RowsTransformDriver {
    fn run(&self, req: DriverRequest<'_>) -> Result<StepOutputs, DriverError> {
        let input_name = req.config.get("input").and_then(Value::as_str).unwrap_or(DEFAULT_INPUT);
        let output_name = req.config.get("output").and_then(Value::as_str).unwrap_or(DEFAULT_OUTPUT);
        let table = req
            .inputs
            .get(input_name)
            .ok_or_else(|| DriverError::MissingInput(input_name.to_owned()))?;

        let drop_cols = str_list(req.config, "drop")?;
        let select_cols = str_list(req.config, "select")?;
        let rename: Vec<(String, String)> = match req.config.get("rename") {
            None => Vec::new(),
            Some(Value::Object(m)) => m
                .iter()
                .map(|(k, v)| {
                    v.as_str()
                        .map(|s| (k.clone(), s.to_owned()))
                        .ok_or_else(|| DriverError::Config(format!("rename target for '{k}' must be a string")))
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(DriverError::Config("rename must be a mapping".into())),
        };
        let sort_by = str_list(req.config, "sort_by")?;
        let limit = match req.config.get("limit") {
            None => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| DriverError::Config("limit must be a non-negative integer".into()))?
                    as usize,
            ),
        };

        let mut rows: Vec<JsonMap<String, Value>> = table.rows().to_vec();

        if !drop_cols.is_empty() {
            for row in &mut rows {
                for col in &drop_cols {
                    row.remove(col);
                }
            }
        }
        if !select_cols.is_empty() {
            rows = rows
                .into_iter()
                .map(|row| {
                    let mut out = JsonMap::new();
                    for col in &select_cols {
                        if let Some(v) = row.get(col) {
                            out.insert(col.clone(), v.clone());
                        }
                    }
                    out
                })
                .collect();
        }
        if !rename.is_empty() {
            for row in &mut rows {
                for (old, new) in &rename {
                    if let Some(v) = row.remove(old) {
                        row.insert(new.clone(), v);
                    }
                }
            }
        }
        if !sort_by.is_empty() {
            rows.sort_by(|a, b| {
                for col in &sort_by {
                    let ord = cmp_values(a.get(col), b.get(col));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        if let Some(n) = limit {
            rows.truncate(n);
        }

        if req.ctx.is_cancelled() {
            return Err(DriverError::Cancelled);
        }

        let result = Table::new(rows);
        let mut tags = JsonMap::new();
        tags.insert("step".into(), Value::String(req.step_id.to_string()));
        req.ctx.log_metric(
            METRIC_ROWS_PROCESSED,
            Number::from(result.len() as u64),
            MetricUnit::Rows,
            tags,
        );

        let mut outputs = StepOutputs::new();
        outputs.insert(output_name.to_owned(), Arc::new(result));
        Ok(outputs)
    }
}

fn str_list(config: &JsonMap<String, Value>, key: &str) -> Result<Vec<String>, DriverError> {
    match config.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| DriverError::Config(format!("{key} entries must be strings")))
            })
            .collect(),
        Some(_) => Err(DriverError::Config(format!("{key} must be a list of strings"))),
    }
}

/// Total order over optional JSON values: absent < null < bool < number <
/// string < array < object; numbers by numeric value with integer/float
/// unified, ties broken by the canonical scalar text.
fn cmp_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal)
            .then_with(|| x.to_string().cmp(&y.to_string())),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => {
            let xs = serde_json::to_string(x).unwrap_or_default();
            let ys = serde_json::to_string(y).unwrap_or_default();
            xs.cmp(&ys)
        }
        _ => Ordering::Equal,
    }
}
