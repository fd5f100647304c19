//! crates/osiris_core/src/redact.rs
//! Uniform secret redaction. One `Redactor` per run; every output path
//! (events, metrics, run records, AIOP layers, error messages) goes through
//! the same instance so no path can drift.
//!
//! Recognition sources, in precedence order:
//!   1. component-spec `secrets` JSON pointers
//!   2. override-policy-forbidden connection fields
//!   3. a fixed list of conventional secret field names
//! Unresolved `${ENV}` placeholders are preserved verbatim; the placeholder
//! itself is not a secret.

use std::collections::BTreeSet;

use serde_json::{Map as JsonMap, Value};

/// The replacement for any masked value.
pub const MASK: &str = "***MASKED***";

/// Conventional secret field names (lowercased comparison).
pub const CONVENTIONAL_SECRET_NAMES: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "key",
    "private_key",
    "service_role_key",
    "access_key",
    "secret_access_key",
    "auth",
    "authorization",
    "credentials",
    "passphrase",
    "dsn",
];

/// True for a verbatim, unresolved env placeholder like `"${MYSQL_PASSWORD}"`.
pub fn is_env_placeholder(s: &str) -> bool {
    s.len() > 3 && s.starts_with("${") && s.ends_with('}')
}

#[derive(Debug, Clone)]
pub struct Redactor {
    /// Field names to mask wherever they appear (lowercased).
    field_names: BTreeSet<String>,
    /// Exact resolved secret values to scrub out of any string, longest first.
    values: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Redactor::new()
    }
}

impl Redactor {
    /// A redactor preloaded with the conventional name list.
    pub fn new() -> Self {
        Redactor {
            field_names: CONVENTIONAL_SECRET_NAMES.iter().map(|s| s.to_string()).collect(),
            values: Vec::new(),
        }
    }

    /// Register a field name to mask (e.g. a forbidden-override field).
    pub fn add_field(&mut self, name: &str) {
        self.field_names.insert(name.to_ascii_lowercase());
    }

    /// Register a component-spec secret JSON pointer ("/password",
    /// "/auth/token"). The final segment becomes a masked field name.
    pub fn add_pointer(&mut self, pointer: &str) {
        if let Some(last) = pointer.rsplit('/').next() {
            if !last.is_empty() {
                self.add_field(last);
            }
        }
    }

    /// Register a resolved secret value so it is scrubbed even when it leaks
    /// into free-form strings (error messages, SQL text).
    pub fn add_value(&mut self, value: &str) {
        if value.is_empty() || is_env_placeholder(value) {
            return;
        }
        if !self.values.iter().any(|v| v == value) {
            self.values.push(value.to_owned());
            // Longest first so substrings of longer secrets don't leave stubs.
            self.values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        }
    }

    pub fn is_secret_field(&self, name: &str) -> bool {
        self.field_names.contains(&name.to_ascii_lowercase())
    }

    /// Redact a JSON value in depth. Secret-named object fields are masked
    /// (unless the value is a verbatim `${…}` placeholder); every string is
    /// scrubbed of registered secret values.
    pub fn redact_value(&self, v: &Value) -> Value {
        match v {
            Value::Object(map) => Value::Object(self.redact_map(map)),
            Value::Array(items) => Value::Array(items.iter().map(|i| self.redact_value(i)).collect()),
            Value::String(s) => Value::String(self.scrub_str(s)),
            other => other.clone(),
        }
    }

    /// Redact an object map (the common case for event payloads).
    pub fn redact_map(&self, map: &JsonMap<String, Value>) -> JsonMap<String, Value> {
        let mut out = JsonMap::with_capacity(map.len());
        for (k, v) in map {
            let masked = if self.is_secret_field(k) {
                match v {
                    Value::String(s) if is_env_placeholder(s) => Value::String(s.clone()),
                    _ => Value::String(MASK.to_owned()),
                }
            } else {
                self.redact_value(v)
            };
            out.insert(k.clone(), masked);
        }
        out
    }

    /// Scrub registered secret values out of an arbitrary string.
    pub fn scrub_str(&self, s: &str) -> String {
        let mut out = s.to_owned();
        for secret in &self.values {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        out
    }
}
