//! Component registry: loads component specifications from disk, validates
//! them, and answers lookups by name.
//!
//! - One YAML file per component under the registry root.
//! - Files are keyed by path + mtime; `refresh` re-reads only what changed.
//! - The registry is populated once per run and read-only afterwards; the
//!   compiled `configSchema` is cached alongside the spec.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use osiris_core::ids::is_valid_token;
use osiris_core::oml::StepMode;

use crate::schema::CompiledSchema;

/// Override policy for a connection field surfaced in step config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverridePolicy {
    Allowed,
    Forbidden,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionFieldPolicy {
    pub name: String,
    #[serde(rename = "override")]
    pub policy: OverridePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeBinding {
    /// Driver registry key this component executes under.
    pub driver: String,
}

/// A component specification as authored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub version: String,
    pub modes: Vec<StepMode>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    #[serde(rename = "configSchema")]
    pub config_schema: Value,
    /// JSON pointers into the resolved config naming secret fields.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(rename = "x-connection-fields", default)]
    pub connection_fields: Vec<ConnectionFieldPolicy>,
    #[serde(rename = "x-runtime")]
    pub runtime: RuntimeBinding,
    #[serde(default)]
    pub examples: Vec<Value>,
}

impl ComponentSpec {
    pub fn supports_mode(&self, mode: StepMode) -> bool {
        self.modes.contains(&mode)
    }

    pub fn policy_for(&self, field: &str) -> Option<OverridePolicy> {
        self.connection_fields
            .iter()
            .find(|p| p.name == field)
            .map(|p| p.policy)
    }

    /// Property names declared in `configSchema.properties`.
    pub fn schema_properties(&self) -> Vec<&str> {
        self.config_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Default values declared in `configSchema.properties.*.default`.
    pub fn schema_defaults(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        if let Some(props) = self.config_schema.get("properties").and_then(Value::as_object) {
            for (name, prop) in props {
                if let Some(d) = prop.get("default") {
                    out.insert(name.clone(), d.clone());
                }
            }
        }
        out
    }
}

/// A spec plus its compiled schema and cache key.
pub struct CachedSpec {
    pub spec: ComponentSpec,
    pub schema: CompiledSchema,
    path: PathBuf,
    mtime: SystemTime,
}

/// Validation depth for `Registry::validate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecValidationLevel {
    Basic,
    Enhanced,
    Strict,
}

/// One finding from spec validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecIssue {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cannot parse spec {path}: {msg}")]
    SpecParse { path: String, msg: String },
    #[error("invalid configSchema in {path}: {msg}")]
    SpecSchema { path: String, msg: String },
    #[error("duplicate component: {0}")]
    DuplicateComponent(String),
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    #[error("registry i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for RegistryError {
    fn from(e: std::io::Error) -> Self {
        RegistryError::Io(e.to_string())
    }
}

/// Loaded registry. Lookup is by component `name` (taken from the spec body,
/// not the filename).
pub struct Registry {
    root: PathBuf,
    specs: BTreeMap<String, CachedSpec>,
}

impl Registry {
    /// A registry with no components (engines can run driver-less commands
    /// like index reads without a component root on disk).
    pub fn empty(root: &Path) -> Self {
        Registry { root: root.to_path_buf(), specs: BTreeMap::new() }
    }

    /// Scan `root` (sorted, one directory level) and load every `.yaml` /
    /// `.yml` file as a component spec.
    pub fn load(root: &Path) -> Result<Self, RegistryError> {
        let mut registry = Registry { root: root.to_path_buf(), specs: BTreeMap::new() };
        for path in spec_files(root)? {
            let cached = load_spec_file(&path)?;
            let name = cached.spec.name.clone();
            if registry.specs.contains_key(&name) {
                return Err(RegistryError::DuplicateComponent(name));
            }
            registry.specs.insert(name, cached);
        }
        Ok(registry)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, name: &str) -> Result<&CachedSpec, RegistryError> {
        self.specs
            .get(name)
            .ok_or_else(|| RegistryError::UnknownComponent(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Component names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.specs.keys().map(String::as_str).collect()
    }

    /// Re-read specs whose file mtime changed, pick up new files, drop
    /// removed ones. Returns true when anything changed. Intended for
    /// long-lived authoring processes; a single compile/run never refreshes
    /// mid-flight.
    pub fn refresh(&mut self) -> Result<bool, RegistryError> {
        let mut changed = false;
        let files = spec_files(&self.root)?;

        // Drop entries whose backing file vanished.
        let live: Vec<String> = self
            .specs
            .iter()
            .filter(|(_, c)| !files.contains(&c.path))
            .map(|(name, _)| name.clone())
            .collect();
        for name in live {
            self.specs.remove(&name);
            changed = true;
        }

        for path in files {
            let mtime = fs::metadata(&path)?.modified()?;
            let stale = match self.specs.values().find(|c| c.path == path) {
                Some(cached) => cached.mtime != mtime,
                None => true,
            };
            if stale {
                let cached = load_spec_file(&path)?;
                let name = cached.spec.name.clone();
                // A rename inside the file counts as remove + add.
                self.specs.retain(|_, c| c.path != path);
                self.specs.insert(name, cached);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Validate one component at the requested depth. Returns findings;
    /// empty means valid at that level.
    pub fn validate(&self, name: &str, level: SpecValidationLevel) -> Result<Vec<SpecIssue>, RegistryError> {
        let cached = self.get(name)?;
        let spec = &cached.spec;
        let mut issues = Vec::new();

        // Basic: required fields and schema shape.
        if !is_valid_token(&spec.name) {
            issues.push(SpecIssue { code: "bad_component_name", message: format!("component name is not a valid token: {}", spec.name) });
        }
        if spec.version.trim().is_empty() {
            issues.push(SpecIssue { code: "missing_version", message: "spec version must be non-empty".into() });
        }
        if spec.modes.is_empty() {
            issues.push(SpecIssue { code: "no_modes", message: "spec must declare at least one mode".into() });
        }
        if !spec.config_schema.is_object() {
            issues.push(SpecIssue { code: "config_schema_not_object", message: "configSchema must be a JSON Schema object".into() });
        }
        for ptr in &spec.secrets {
            if !ptr.starts_with('/') {
                issues.push(SpecIssue { code: "bad_secret_pointer", message: format!("secret pointer must start with '/': {ptr}") });
            }
        }

        if level == SpecValidationLevel::Basic {
            return Ok(issues);
        }

        // Enhanced: every example must validate against configSchema.
        for (i, example) in spec.examples.iter().enumerate() {
            for violation in cached.schema.validate(example) {
                issues.push(SpecIssue {
                    code: "example_schema_violation",
                    message: format!("example {i} at {}: {}", violation.pointer, violation.message),
                });
            }
        }

        if level == SpecValidationLevel::Enhanced {
            return Ok(issues);
        }

        // Strict: policy completeness and driver binding.
        let props = spec.schema_properties();
        for policy in &spec.connection_fields {
            if !props.contains(&policy.name.as_str()) {
                issues.push(SpecIssue {
                    code: "policy_field_not_in_schema",
                    message: format!("x-connection-fields entry '{}' is not a configSchema property", policy.name),
                });
            }
        }
        if spec.runtime.driver.trim().is_empty() {
            issues.push(SpecIssue { code: "missing_driver_binding", message: "x-runtime.driver must be non-empty".into() });
        }

        Ok(issues)
    }
}

/// Sorted list of spec files directly under `root`.
fn spec_files(root: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn load_spec_file(path: &Path) -> Result<CachedSpec, RegistryError> {
    let mtime = fs::metadata(path)?.modified()?;
    let text = fs::read_to_string(path)?;
    let spec: ComponentSpec = serde_yaml::from_str(&text).map_err(|e| RegistryError::SpecParse {
        path: path.display().to_string(),
        msg: e.to_string(),
    })?;
    let schema = CompiledSchema::compile(&spec.config_schema).map_err(|e| RegistryError::SpecSchema {
        path: path.display().to_string(),
        msg: e.to_string(),
    })?;
    Ok(CachedSpec { spec, schema, path: path.to_path_buf(), mtime })
}
