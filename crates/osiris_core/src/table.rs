//! crates/osiris_core/src/table.rs
//! In-memory tabular values exchanged between steps (batch-only dataflow).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// A batch of rows. Row order is meaningful and preserved; the column set
/// is the sorted union of the keys of all rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    rows: Vec<JsonMap<String, Value>>,
}

impl Table {
    pub fn new(rows: Vec<JsonMap<String, Value>>) -> Self {
        Table { rows }
    }

    /// Build from a JSON array of objects; non-object elements are an error.
    pub fn from_values(values: Vec<Value>) -> Result<Self, TableError> {
        let mut rows = Vec::with_capacity(values.len());
        for (i, v) in values.into_iter().enumerate() {
            match v {
                Value::Object(m) => rows.push(m),
                other => return Err(TableError::NotAnObject { index: i, got: kind_name(&other) }),
            }
        }
        Ok(Table { rows })
    }

    #[inline]
    pub fn rows(&self) -> &[JsonMap<String, Value>] {
        &self.rows
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sorted union of all row keys. Deterministic for a given table.
    pub fn columns(&self) -> Vec<String> {
        let mut cols = BTreeSet::new();
        for row in &self.rows {
            for k in row.keys() {
                cols.insert(k.clone());
            }
        }
        cols.into_iter().collect()
    }
}

/// Read-only handles: the runtime hands drivers `Arc<Table>` so upstream
/// outputs cannot be mutated by downstream consumers.
pub type StepInputs = BTreeMap<String, Arc<Table>>;
pub type StepOutputs = BTreeMap<String, Arc<Table>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("row {index} is not an object (got {got})")]
    NotAnObject { index: usize, got: &'static str },
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn columns_are_sorted_union() {
        let t = Table::from_values(vec![json!({"b": 1}), json!({"a": 2, "c": 3})]).unwrap();
        assert_eq!(t.columns(), vec!["a", "b", "c"]);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn rejects_non_objects() {
        let err = Table::from_values(vec![json!({"a": 1}), json!(3)]).unwrap_err();
        assert_eq!(err, TableError::NotAnObject { index: 1, got: "number" });
    }
}
