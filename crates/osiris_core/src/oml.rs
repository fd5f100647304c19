//! crates/osiris_core/src/oml.rs
//! The OML document model: the declarative pipeline description consumed
//! by the validator and compiler.
//!
//! Parsing is two-staged on purpose: the validator first inspects the raw
//! `serde_json::Value` (forbidden legacy keys, missing required keys must be
//! reported with stable codes, not as serde noise), then converts to the
//! typed model below for everything downstream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// The only OML version this engine accepts.
pub const OML_VERSION: &str = "0.1.0";

/// Legacy top-level keys from the pre-OML format; their presence is a
/// structural validation error, never silently ignored.
pub const FORBIDDEN_TOP_LEVEL_KEYS: &[&str] = &["version", "connectors", "tasks", "outputs"];

/// Required top-level keys.
pub const REQUIRED_TOP_LEVEL_KEYS: &[&str] = &["oml_version", "name", "steps"];

/// Step execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    Read,
    Write,
    Transform,
}

impl StepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepMode::Read => "read",
            StepMode::Write => "write",
            StepMode::Transform => "transform",
        }
    }
}

/// One pipeline step as authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmlStep {
    /// Unique within the pipeline; validated into a `StepId` by the validator.
    pub id: String,
    /// Component registry key (e.g. "mysql.extractor").
    pub component: String,
    pub mode: StepMode,
    #[serde(default)]
    pub config: JsonMap<String, Value>,
    /// Upstream step ids this step depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    /// Logical input name → "${upstream_id.output}" reference.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
}

/// A parsed OML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmlDocument {
    pub oml_version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub steps: Vec<OmlStep>,
}

impl OmlDocument {
    /// Typed conversion from an already structurally-validated value.
    pub fn from_value(v: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(v.clone())
    }

    /// Effective profile name ("default" when unset).
    pub fn profile(&self) -> &str {
        self.profile.as_deref().unwrap_or("default")
    }
}

/// Parse an input reference of the form `"${upstream_id.output}"` into
/// `(upstream_id, output_name)`. Returns `None` for any other shape.
pub fn parse_input_ref(s: &str) -> Option<(&str, &str)> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    let (step, output) = inner.split_once('.')?;
    if step.is_empty() || output.is_empty() {
        return None;
    }
    Some((step, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_parse_roundtrip() {
        let v = json!({
            "oml_version": "0.1.0",
            "name": "orders-to-csv",
            "steps": [
                {"id": "extract", "component": "db.extractor", "mode": "read",
                 "config": {"table": "orders", "connection": "@mysql.main"}},
                {"id": "write", "component": "csv.writer", "mode": "write",
                 "config": {"path": "out.csv"},
                 "needs": ["extract"],
                 "inputs": {"df": "${extract.df}"}}
            ]
        });
        let doc = OmlDocument::from_value(&v).unwrap();
        assert_eq!(doc.oml_version, OML_VERSION);
        assert_eq!(doc.profile(), "default");
        assert_eq!(doc.steps.len(), 2);
        assert_eq!(doc.steps[1].needs, vec!["extract"]);
        assert_eq!(doc.steps[1].inputs["df"], "${extract.df}");
    }

    #[test]
    fn input_refs() {
        assert_eq!(parse_input_ref("${extract.df}"), Some(("extract", "df")));
        assert_eq!(parse_input_ref("${a.b.c}"), Some(("a", "b.c")));
        assert_eq!(parse_input_ref("extract.df"), None);
        assert_eq!(parse_input_ref("${extract}"), None);
        assert_eq!(parse_input_ref("${.df}"), None);
    }
}
