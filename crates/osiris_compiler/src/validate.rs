//! Structural, semantic, and pre-runtime validation of OML documents.
//!
//! Three layers, executed in order; the first layer that records an error
//! short-circuits the rest. Findings carry stable snake_case codes and are
//! deterministically ordered, so two validations of the same document render
//! byte-identical reports.
//!
//! The validator is pure: the registry and connections are explicit inputs
//! and the process environment is never read (env placeholders stay
//! symbolic here).

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map as JsonMap, Value};

use osiris_core::ids::{is_valid_token, ConnectionRef, StepId};
use osiris_core::oml::{
    parse_input_ref, OmlDocument, StepMode, FORBIDDEN_TOP_LEVEL_KEYS, OML_VERSION,
    REQUIRED_TOP_LEVEL_KEYS,
};
use osiris_core::redact::Redactor;
use osiris_io::connections::{ConnectionError, ConnectionResolver};
use osiris_io::registry::{OverridePolicy, Registry};

/// Finding severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

/// One validation finding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    /// Where the issue occurred ("/" for the document root, otherwise a
    /// step id or step id + field path).
    pub location: String,
}

/// Deterministic report: `ok` = no errors; ordering of findings is stable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_issues(mut issues: Vec<ValidationIssue>) -> Self {
        sort_issues_stably(&mut issues);
        let (errors, warnings): (Vec<_>, Vec<_>) =
            issues.into_iter().partition(|i| i.severity == Severity::Error);
        ValidationReport { ok: errors.is_empty(), errors, warnings }
    }
}

/// Config keys that never reach the canonical config (authoring metadata).
pub const META_CONFIG_KEYS: &[&str] = &["description", "comment"];

/// Top-level entry point: L1 structural → L2 semantic → L3 pre-runtime.
pub fn validate_oml(
    raw: &Value,
    registry: &Registry,
    resolver: &ConnectionResolver,
) -> ValidationReport {
    let mut issues = check_structural(raw);
    if issues.iter().any(|i| i.severity == Severity::Error) {
        return ValidationReport::from_issues(issues);
    }

    // L1 passed; the typed parse cannot fail on required shape now.
    let doc = match OmlDocument::from_value(raw) {
        Ok(doc) => doc,
        Err(e) => {
            issues.push(error("structural_parse", "/", format!("cannot parse document: {e}")));
            return ValidationReport::from_issues(issues);
        }
    };

    issues.extend(check_semantic(&doc, registry, resolver));
    if issues.iter().any(|i| i.severity == Severity::Error) {
        return ValidationReport::from_issues(issues);
    }

    issues.extend(check_pre_runtime(&doc, registry, resolver));
    ValidationReport::from_issues(issues)
}

fn error(code: &'static str, location: impl Into<String>, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue { severity: Severity::Error, code, message: message.into(), location: location.into() }
}

fn warning(code: &'static str, location: impl Into<String>, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue { severity: Severity::Warning, code, message: message.into(), location: location.into() }
}

// ------------------------------------------------------------------------------------------------
// L1: structural
// ------------------------------------------------------------------------------------------------

fn check_structural(raw: &Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let Some(root) = raw.as_object() else {
        issues.push(error("not_a_mapping", "/", "OML document must be a mapping"));
        return issues;
    };

    for key in FORBIDDEN_TOP_LEVEL_KEYS {
        if root.contains_key(*key) {
            issues.push(error("forbidden_top_level_key", "/", format!("forbidden_top_level_key={key}")));
        }
    }
    for key in REQUIRED_TOP_LEVEL_KEYS {
        if !root.contains_key(*key) {
            issues.push(error("missing_top_level_key", "/", format!("missing_top_level_key={key}")));
        }
    }

    if let Some(version) = root.get("oml_version") {
        match version.as_str() {
            Some(OML_VERSION) => {}
            Some(other) => issues.push(error(
                "unsupported_oml_version",
                "/",
                format!("oml_version must be \"{OML_VERSION}\", got \"{other}\""),
            )),
            None => issues.push(error("unsupported_oml_version", "/", "oml_version must be a string")),
        }
    }

    if let Some(name) = root.get("name") {
        if name.as_str().map(str::is_empty).unwrap_or(true) {
            issues.push(error("invalid_name", "/", "name must be a non-empty string"));
        }
    }

    let Some(steps) = root.get("steps") else { return issues };
    let Some(steps) = steps.as_array() else {
        issues.push(error("steps_not_a_list", "/steps", "steps must be a sequence"));
        return issues;
    };
    if steps.is_empty() {
        issues.push(error("empty_steps", "/steps", "steps must be non-empty"));
    }

    let mut seen_ids: BTreeSet<&str> = BTreeSet::new();
    for (i, step) in steps.iter().enumerate() {
        let loc = format!("/steps/{i}");
        let Some(step) = step.as_object() else {
            issues.push(error("step_not_a_mapping", loc, "step must be a mapping"));
            continue;
        };
        for field in ["id", "component", "mode"] {
            if !step.contains_key(field) {
                issues.push(error("step_missing_field", loc.clone(), format!("step is missing '{field}'")));
            }
        }
        if let Some(id) = step.get("id").and_then(Value::as_str) {
            if !is_valid_token(id) {
                issues.push(error("invalid_step_id", loc.clone(), format!("invalid step id: {id}")));
            } else if !seen_ids.insert(id) {
                issues.push(error("duplicate_step_id", loc.clone(), format!("duplicate step id: {id}")));
            }
        }
        if let Some(mode) = step.get("mode") {
            let ok = mode
                .as_str()
                .map(|m| matches!(m, "read" | "write" | "transform"))
                .unwrap_or(false);
            if !ok {
                issues.push(error("invalid_mode", loc.clone(), "mode must be one of read|write|transform"));
            }
        }
    }

    issues
}

// ------------------------------------------------------------------------------------------------
// L2: semantic (cross-field business rules; registry-aware, no env)
// ------------------------------------------------------------------------------------------------

fn check_semantic(
    doc: &OmlDocument,
    registry: &Registry,
    resolver: &ConnectionResolver,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let step_ids: BTreeSet<&str> = doc.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &doc.steps {
        let loc = step.id.clone();

        let cached = match registry.get(&step.component) {
            Ok(c) => c,
            Err(_) => {
                issues.push(error("unknown_component", loc, format!("unknown component: {}", step.component)));
                continue;
            }
        };
        let spec = &cached.spec;

        if !spec.supports_mode(step.mode) {
            issues.push(error(
                "unsupported_mode",
                loc.clone(),
                format!("component {} does not support mode {}", step.component, step.mode.as_str()),
            ));
        }

        // Writers with replace/upsert semantics need a primary key.
        if step.mode == StepMode::Write {
            let write_mode = step.config.get("write_mode").and_then(Value::as_str);
            if matches!(write_mode, Some("replace") | Some("upsert")) {
                let pk_ok = match step.config.get("primary_key") {
                    Some(Value::String(s)) => !s.is_empty(),
                    Some(Value::Array(a)) => !a.is_empty(),
                    _ => false,
                };
                if !pk_ok {
                    issues.push(error(
                        "upsert_requires_primary_key",
                        loc.clone(),
                        format!("write_mode={} requires a non-empty primary_key", write_mode.unwrap_or("")),
                    ));
                }
            }
        }

        // Database extractors (schema offers both) take exactly one of query | table.
        let props = spec.schema_properties();
        if step.mode == StepMode::Read && props.contains(&"query") && props.contains(&"table") {
            let has_query = step.config.get("query").and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false);
            let has_table = step.config.get("table").and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false);
            if has_query == has_table {
                issues.push(error(
                    "query_xor_table",
                    loc.clone(),
                    "exactly one of 'query' or 'table' must be set",
                ));
            }
        }

        // Filesystem writers (schema offers a path) need one.
        if step.mode == StepMode::Write && props.contains(&"path") {
            let has_path = step.config.get("path").and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false);
            if !has_path {
                issues.push(error("missing_path", loc.clone(), "writer requires a non-empty 'path'"));
            }
        }

        // Connection reference: must parse and must be known.
        if let Some(conn) = step.config.get("connection") {
            match conn.as_str().map(str::parse::<ConnectionRef>) {
                Some(Ok(r)) => match resolver.knows(&r) {
                    Ok(()) => {}
                    Err(ConnectionError::UnknownFamily(f)) => {
                        issues.push(error("unknown_connection_family", loc.clone(), format!("unknown connection family: {f}")));
                    }
                    Err(ConnectionError::UnknownAlias(f, a)) => {
                        issues.push(error("unknown_connection_alias", loc.clone(), format!("unknown connection alias: {f}.{a}")));
                    }
                    Err(e) => {
                        issues.push(error("bad_connection_ref", loc.clone(), e.to_string()));
                    }
                },
                _ => {
                    issues.push(error(
                        "bad_connection_ref",
                        loc.clone(),
                        "connection must be a string of the form \"@family.alias\"",
                    ));
                }
            }
        } else if !spec.connection_fields.is_empty() {
            // A connection-backed component with no explicit reference needs
            // a default alias for its family (first dotted segment of the
            // component name).
            let family = step.component.split('.').next().unwrap_or_default();
            if resolver.default_alias(family).is_none() {
                issues.push(error(
                    "missing_connection",
                    loc.clone(),
                    format!("no connection given and no default alias for family '{family}'"),
                ));
            }
        }

        // Dependency references resolve.
        for need in &step.needs {
            if !step_ids.contains(need.as_str()) {
                issues.push(error("dangling_needs", loc.clone(), format!("needs references unknown step: {need}")));
            }
        }
        for (input, reference) in &step.inputs {
            match parse_input_ref(reference) {
                Some((upstream, _)) if step_ids.contains(upstream) => {}
                Some((upstream, _)) => {
                    issues.push(error(
                        "dangling_input_ref",
                        loc.clone(),
                        format!("input '{input}' references unknown step: {upstream}"),
                    ));
                }
                None => {
                    issues.push(error(
                        "bad_input_ref",
                        loc.clone(),
                        format!("input '{input}' must look like \"${{step.output}}\""),
                    ));
                }
            }
        }
    }

    // DAG acyclicity (only meaningful once references resolve).
    if issues.iter().all(|i| i.code != "dangling_needs" && i.code != "dangling_input_ref") {
        if let Some(cycle_member) = find_cycle_member(doc) {
            issues.push(error("cycle_detected", cycle_member, "dependency cycle detected"));
        }
    }

    issues
}

/// Kahn's algorithm; returns a step id inside a cycle, if any. Deterministic
/// because candidate selection follows authored order.
fn find_cycle_member(doc: &OmlDocument) -> Option<String> {
    let order: Vec<&str> = doc.steps.iter().map(|s| s.id.as_str()).collect();
    let mut indegree: BTreeMap<&str, usize> = order.iter().map(|id| (*id, 0)).collect();
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for step in &doc.steps {
        for dep in upstream_ids(step) {
            edges.entry(dep).or_default().push(step.id.as_str());
            *indegree.get_mut(step.id.as_str()).expect("id present") += 1;
        }
    }

    let mut done = 0usize;
    let mut ready: Vec<&str> = order.iter().copied().filter(|id| indegree[id] == 0).collect();
    while let Some(id) = ready.first().copied() {
        ready.remove(0);
        done += 1;
        if let Some(dsts) = edges.get(id) {
            for dst in dsts {
                let d = indegree.get_mut(dst).expect("id present");
                *d -= 1;
                if *d == 0 {
                    // Keep authored order among newly-ready nodes.
                    let pos = order.iter().position(|o| o == dst).expect("id present");
                    let insert_at = ready
                        .iter()
                        .position(|r| order.iter().position(|o| o == r).expect("id present") > pos)
                        .unwrap_or(ready.len());
                    ready.insert(insert_at, dst);
                }
            }
        }
    }

    if done == order.len() {
        return None;
    }
    order
        .iter()
        .find(|id| indegree[*id] > 0)
        .map(|id| (*id).to_string())
}

/// Distinct upstream ids of a step: `needs` plus input references, in
/// first-mention order.
pub fn upstream_ids(step: &osiris_core::oml::OmlStep) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for need in &step.needs {
        if !out.contains(&need.as_str()) {
            out.push(need);
        }
    }
    for reference in step.inputs.values() {
        if let Some((upstream, _)) = parse_input_ref(reference) {
            if !out.contains(&upstream) {
                out.push(upstream);
            }
        }
    }
    out
}

// ------------------------------------------------------------------------------------------------
// L3: pre-runtime (merged config vs schema; override policies)
// ------------------------------------------------------------------------------------------------

fn check_pre_runtime(
    doc: &OmlDocument,
    registry: &Registry,
    resolver: &ConnectionResolver,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    for step in &doc.steps {
        let loc = step.id.clone();
        let cached = match registry.get(&step.component) {
            Ok(c) => c,
            Err(_) => continue, // already reported in L2
        };
        let spec = &cached.spec;

        // Override policy enforcement (value-free findings).
        for policy in &spec.connection_fields {
            if !step.config.contains_key(&policy.name) {
                continue;
            }
            match policy.policy {
                OverridePolicy::Forbidden => {
                    issues.push(error(
                        "forbidden_override",
                        loc.clone(),
                        format!("forbidden_override={}", policy.name),
                    ));
                }
                OverridePolicy::Warning => {
                    issues.push(warning(
                        "override_warning",
                        loc.clone(),
                        format!("step overrides connection field '{}'", policy.name),
                    ));
                }
                OverridePolicy::Allowed => {}
            }
        }

        // Merged config: connection alias fields ∪ step config (step wins),
        // env placeholders symbolic, meta keys dropped.
        let mut merged: JsonMap<String, Value> = JsonMap::new();
        if let Some(Value::String(conn)) = step.config.get("connection") {
            if let Ok(r) = conn.parse::<ConnectionRef>() {
                if let Ok(fields) = resolver.alias_fields(&r) {
                    merged.extend(fields);
                }
            }
        }
        for (k, v) in &step.config {
            if META_CONFIG_KEYS.contains(&k.as_str()) {
                continue;
            }
            merged.insert(k.clone(), v.clone());
        }

        // Mask secret-named values before schema validation so violation
        // messages can never carry a secret.
        let mut redactor = Redactor::new();
        for ptr in &spec.secrets {
            redactor.add_pointer(ptr);
        }
        let masked = redactor.redact_map(&merged);

        for violation in cached.schema.validate(&Value::Object(masked)) {
            issues.push(error(
                "schema_violation",
                format!("{loc}{}", violation.pointer),
                violation.message,
            ));
        }
    }

    issues
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Deterministic sort (by code, then location, then message) for
/// byte-identical reports across runs.
fn sort_issues_stably(issues: &mut [ValidationIssue]) {
    issues.sort_by(|a, b| {
        a.code
            .cmp(b.code)
            .then_with(|| a.location.cmp(&b.location))
            .then_with(|| a.message.cmp(&b.message))
    });
}

/// Parsed step ids in topological order, authored order breaking ties.
/// Callers must have validated acyclicity first.
pub fn topological_order(doc: &OmlDocument) -> Vec<StepId> {
    let order: Vec<&str> = doc.steps.iter().map(|s| s.id.as_str()).collect();
    let mut indegree: BTreeMap<&str, usize> = order.iter().map(|id| (*id, 0)).collect();
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for step in &doc.steps {
        for dep in upstream_ids(step) {
            edges.entry(dep).or_default().push(step.id.as_str());
            if let Some(d) = indegree.get_mut(step.id.as_str()) {
                *d += 1;
            }
        }
    }

    let mut out: Vec<StepId> = Vec::with_capacity(order.len());
    let mut remaining: Vec<&str> = order.clone();
    while !remaining.is_empty() {
        // First authored step whose deps are all emitted.
        let pos = remaining
            .iter()
            .position(|id| indegree[id] == 0)
            .expect("acyclic by precondition");
        let id = remaining.remove(pos);
        out.push(id.parse().expect("validated step id"));
        if let Some(dsts) = edges.get(id) {
            for dst in dsts {
                *indegree.get_mut(dst).expect("id present") -= 1;
            }
        }
    }
    out
}
