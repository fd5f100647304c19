//! Connection resolution: turn a symbolic `@family.alias` reference into a
//! fully-resolved credential mapping at execution time.
//!
//! - Override policies (from the component spec) gate step-level overrides.
//! - `${ENV}` placeholders resolve from the environment source; an empty
//!   value counts as unset and fails resolution.
//! - Display paths never see raw secrets: `masked` goes through the same
//!   `Redactor` as every other output path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use osiris_core::ids::ConnectionRef;
use osiris_core::redact::{is_env_placeholder, Redactor};

use crate::registry::{ConnectionFieldPolicy, OverridePolicy};

/// The connections file: `connections.<family>.<alias>.<field>`.
/// A boolean `default: true` field marks the family's default alias and is
/// not part of the credential mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionsFile {
    #[serde(default)]
    pub connections: BTreeMap<String, BTreeMap<String, JsonMap<String, Value>>>,
}

impl ConnectionsFile {
    pub fn load(path: &std::path::Path) -> Result<Self, ConnectionError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConnectionError::Io(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&text).map_err(|e| ConnectionError::Parse(e.to_string()))
    }
}

/// Where `${ENV}` placeholders resolve from. The process environment in
/// production; a plain map in tests (keeps the validator and tests pure).
pub trait EnvSource {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads the real process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        BTreeMap::get(self, name).cloned()
    }
}

/// A resolved connection. Contains live secrets; never serialized to any
/// artifact. Display goes through `masked`.
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub family: String,
    pub alias: String,
    pub fields: JsonMap<String, Value>,
}

impl ResolvedConnection {
    /// Display-safe copy: secret fields replaced with the mask, verbatim
    /// `${…}` placeholders preserved.
    pub fn masked(&self, redactor: &Redactor) -> JsonMap<String, Value> {
        redactor.redact_map(&self.fields)
    }
}

/// Non-fatal findings from a resolution (e.g. warning-policy overrides).
#[derive(Debug, Clone, Default)]
pub struct ResolveDiagnostics {
    pub warnings: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("unknown connection family: {0}")]
    UnknownFamily(String),
    #[error("unknown connection alias: {0}.{1}")]
    UnknownAlias(String, String),
    /// Deliberately value-free: the message names the field only.
    #[error("step config overrides forbidden connection field: {0}")]
    ForbiddenOverride(String),
    #[error("environment variable not set (or empty): {0}")]
    MissingEnv(String),
    #[error("cannot read connections file: {0}")]
    Io(String),
    #[error("cannot parse connections file: {0}")]
    Parse(String),
}

/// Resolver over a loaded connections file. Process-wide, immutable after
/// startup.
pub struct ConnectionResolver {
    file: ConnectionsFile,
}

impl ConnectionResolver {
    pub fn new(file: ConnectionsFile) -> Self {
        ConnectionResolver { file }
    }

    /// The family's default alias, if one is marked.
    pub fn default_alias(&self, family: &str) -> Option<&str> {
        let aliases = self.file.connections.get(family)?;
        aliases
            .iter()
            .find(|(_, fields)| fields.get("default").and_then(Value::as_bool) == Some(true))
            .map(|(alias, _)| alias.as_str())
    }

    /// True iff the reference names a known family and alias. Used by the
    /// validator (which must not read the environment).
    pub fn knows(&self, r: &ConnectionRef) -> Result<(), ConnectionError> {
        let aliases = self
            .file
            .connections
            .get(r.family())
            .ok_or_else(|| ConnectionError::UnknownFamily(r.family().to_owned()))?;
        if !aliases.contains_key(r.alias()) {
            return Err(ConnectionError::UnknownAlias(r.family().to_owned(), r.alias().to_owned()));
        }
        Ok(())
    }

    /// The alias's raw field mapping, symbolic `${ENV}` placeholders intact
    /// and the `default` marker stripped. The validator merges these without
    /// touching the environment.
    pub fn alias_fields(&self, r: &ConnectionRef) -> Result<JsonMap<String, Value>, ConnectionError> {
        self.knows(r)?;
        Ok(self.file.connections[r.family()][r.alias()]
            .iter()
            .filter(|(k, _)| k.as_str() != "default")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Resolve a reference against the step config and the component's
    /// override policies.
    pub fn resolve(
        &self,
        r: &ConnectionRef,
        step_config: &JsonMap<String, Value>,
        policies: &[ConnectionFieldPolicy],
        env: &dyn EnvSource,
    ) -> Result<(ResolvedConnection, ResolveDiagnostics), ConnectionError> {
        self.knows(r)?;
        let base = &self.file.connections[r.family()][r.alias()];

        let mut fields: JsonMap<String, Value> = base
            .iter()
            .filter(|(k, _)| k.as_str() != "default")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut diagnostics = ResolveDiagnostics::default();

        // Apply step-level overrides per policy. Fields without a declared
        // policy are step config, not connection config; they are ignored here.
        for policy in policies {
            let Some(step_value) = step_config.get(&policy.name) else { continue };
            match policy.policy {
                OverridePolicy::Forbidden => {
                    return Err(ConnectionError::ForbiddenOverride(policy.name.clone()));
                }
                OverridePolicy::Warning => {
                    diagnostics
                        .warnings
                        .push(format!("step overrides connection field '{}'", policy.name));
                    fields.insert(policy.name.clone(), step_value.clone());
                }
                OverridePolicy::Allowed => {
                    fields.insert(policy.name.clone(), step_value.clone());
                }
            }
        }

        // Resolve whole-string `${ENV}` placeholders.
        for (_, v) in fields.iter_mut() {
            if let Value::String(s) = v {
                if is_env_placeholder(s) {
                    let var = &s[2..s.len() - 1];
                    match env.get(var) {
                        Some(val) if !val.is_empty() => *v = Value::String(val),
                        _ => return Err(ConnectionError::MissingEnv(var.to_owned())),
                    }
                }
            }
        }

        Ok((
            ResolvedConnection {
                family: r.family().to_owned(),
                alias: r.alias().to_owned(),
                fields,
            },
            diagnostics,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> ConnectionResolver {
        let file: ConnectionsFile = serde_yaml::from_str(
            r#"
connections:
  mysql:
    main:
      default: true
      host: db.internal
      port: 3306
      user: osiris
      password: "${MYSQL_PASSWORD}"
    replica:
      host: replica.internal
      user: osiris
      password: "${MYSQL_PASSWORD}"
"#,
        )
        .unwrap();
        ConnectionResolver::new(file)
    }

    fn policies() -> Vec<ConnectionFieldPolicy> {
        serde_yaml::from_str(
            r#"
- {name: host, override: allowed}
- {name: port, override: warning}
- {name: password, override: forbidden}
"#,
        )
        .unwrap()
    }

    fn env() -> BTreeMap<String, String> {
        [("MYSQL_PASSWORD".to_string(), "hunter2".to_string())].into_iter().collect()
    }

    #[test]
    fn resolves_with_env_and_default_marker_stripped() {
        let r = resolver();
        let (conn, diags) = r
            .resolve(&"@mysql.main".parse().unwrap(), &JsonMap::new(), &policies(), &env())
            .unwrap();
        assert_eq!(conn.fields["password"], "hunter2");
        assert_eq!(conn.fields["host"], "db.internal");
        assert!(!conn.fields.contains_key("default"));
        assert!(diags.warnings.is_empty());
        assert_eq!(r.default_alias("mysql"), Some("main"));
    }

    #[test]
    fn allowed_and_warning_overrides_merge() {
        let r = resolver();
        let step: JsonMap<String, Value> =
            json!({"host": "override.internal", "port": 3307}).as_object().unwrap().clone();
        let (conn, diags) = r
            .resolve(&"@mysql.main".parse().unwrap(), &step, &policies(), &env())
            .unwrap();
        assert_eq!(conn.fields["host"], "override.internal");
        assert_eq!(conn.fields["port"], 3307);
        assert_eq!(diags.warnings.len(), 1);
        assert!(diags.warnings[0].contains("port"));
    }

    #[test]
    fn forbidden_override_fails_without_leaking_value() {
        let r = resolver();
        let step: JsonMap<String, Value> =
            json!({"password": "hacked"}).as_object().unwrap().clone();
        let err = r
            .resolve(&"@mysql.main".parse().unwrap(), &step, &policies(), &env())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("password"));
        assert!(!msg.contains("hacked"));
    }

    #[test]
    fn missing_and_empty_env_fail() {
        let r = resolver();
        let empty_env: BTreeMap<String, String> =
            [("MYSQL_PASSWORD".to_string(), String::new())].into_iter().collect();
        for e in [BTreeMap::new(), empty_env] {
            let err = r
                .resolve(&"@mysql.main".parse().unwrap(), &JsonMap::new(), &policies(), &e)
                .unwrap_err();
            assert!(matches!(err, ConnectionError::MissingEnv(ref v) if v == "MYSQL_PASSWORD"));
        }
    }

    #[test]
    fn unknown_family_and_alias() {
        let r = resolver();
        assert!(matches!(
            r.knows(&"@pg.main".parse().unwrap()),
            Err(ConnectionError::UnknownFamily(_))
        ));
        assert!(matches!(
            r.knows(&"@mysql.backup".parse().unwrap()),
            Err(ConnectionError::UnknownAlias(_, _))
        ));
    }

    #[test]
    fn masked_view_hides_secrets_keeps_placeholders() {
        let r = resolver();
        let (conn, _) = r
            .resolve(&"@mysql.main".parse().unwrap(), &JsonMap::new(), &policies(), &env())
            .unwrap();
        let mut redactor = Redactor::new();
        redactor.add_value("hunter2");
        let masked = conn.masked(&redactor);
        assert_eq!(masked["password"], osiris_core::redact::MASK);
        assert_eq!(masked["host"], "db.internal");

        // Unresolved placeholder stays verbatim on the display path.
        let raw = ResolvedConnection {
            family: "mysql".into(),
            alias: "main".into(),
            fields: json!({"password": "${MYSQL_PASSWORD}"}).as_object().unwrap().clone(),
        };
        assert_eq!(raw.masked(&redactor)["password"], "${MYSQL_PASSWORD}");
    }
}
