//! JSON Schema (2020-12) validation wrapper.
//!
//! One compiled schema per component spec, built once at registry load.
//! Violations carry the instance JSON Pointer and a message; callers decide
//! severity (the L3 validator turns them into stable error codes).

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::IoError;

/// A schema value paired with its compiled validator.
pub struct CompiledSchema {
    raw: Value,
    compiled: JSONSchema,
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema").field("raw", &self.raw).finish()
    }
}

/// One violation of an instance against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON Pointer into the instance ("" for the root).
    pub pointer: String,
    pub message: String,
}

impl CompiledSchema {
    /// Compile under draft 2020-12. The raw value is kept for re-serialization
    /// (manifests embed component schemas by value in the semantic layer).
    pub fn compile(raw: &Value) -> Result<Self, IoError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(raw)
            .map_err(|e| IoError::Schema(e.to_string()))?;
        Ok(CompiledSchema { raw: raw.clone(), compiled })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Validate an instance; returns all violations, deterministically ordered
    /// by pointer then message.
    pub fn validate(&self, instance: &Value) -> Vec<SchemaViolation> {
        let mut out = match self.compiled.validate(instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| SchemaViolation {
                    pointer: e.instance_path.to_string(),
                    message: e.to_string(),
                })
                .collect(),
        };
        out.sort_by(|a, b| a.pointer.cmp(&b.pointer).then_with(|| a.message.cmp(&b.message)));
        out
    }

    pub fn is_valid(&self, instance: &Value) -> bool {
        self.compiled.is_valid(instance)
    }
}
