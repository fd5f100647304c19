//! AIOP export policy with layered configuration.
//!
//! Precedence (highest wins): CLI flags > `OSIRIS_AIOP_*` environment
//! variables > config file (`osiris.yaml`, `aiop:` section) > defaults.

use std::path::Path;

use serde::Deserialize;

pub const ENV_MAX_CORE_BYTES: &str = "OSIRIS_AIOP_MAX_CORE_BYTES";
pub const ENV_TIMELINE_DENSITY: &str = "OSIRIS_AIOP_TIMELINE_DENSITY";
pub const ENV_METRICS_TOPK: &str = "OSIRIS_AIOP_METRICS_TOPK";
pub const ENV_SCHEMA_MODE: &str = "OSIRIS_AIOP_SCHEMA_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineDensity {
    Minimal,
    Medium,
    Verbose,
}

impl TimelineDensity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minimal" => Some(TimelineDensity::Minimal),
            "medium" => Some(TimelineDensity::Medium),
            "verbose" => Some(TimelineDensity::Verbose),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineDensity::Minimal => "minimal",
            TimelineDensity::Medium => "medium",
            TimelineDensity::Verbose => "verbose",
        }
    }
}

/// How much of the component metadata the semantic layer embeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// Component names/versions/modes only.
    Compact,
    /// Additionally embeds each component's configSchema by value.
    Full,
}

impl SchemaMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compact" => Some(SchemaMode::Compact),
            "full" => Some(SchemaMode::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaMode::Compact => "compact",
            SchemaMode::Full => "full",
        }
    }
}

/// Whether to always write the annex or only bound the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPolicy {
    Core,
    Annex,
}

impl ExportPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "core" => Some(ExportPolicy::Core),
            "annex" => Some(ExportPolicy::Annex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportPolicy::Core => "core",
            ExportPolicy::Annex => "annex",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiopPolicy {
    pub max_core_bytes: usize,
    pub timeline_density: TimelineDensity,
    pub metrics_topk: usize,
    pub schema_mode: SchemaMode,
    pub policy: ExportPolicy,
    /// Gzip annex shards.
    pub annex_gzip: bool,
}

impl Default for AiopPolicy {
    fn default() -> Self {
        AiopPolicy {
            max_core_bytes: 300 * 1024,
            timeline_density: TimelineDensity::Medium,
            metrics_topk: 10,
            schema_mode: SchemaMode::Compact,
            policy: ExportPolicy::Core,
            annex_gzip: false,
        }
    }
}

/// CLI-level overrides (all optional; only set fields override).
#[derive(Debug, Clone, Default)]
pub struct PolicyOverrides {
    pub max_core_bytes: Option<usize>,
    pub timeline_density: Option<TimelineDensity>,
    pub metrics_topk: Option<usize>,
    pub schema_mode: Option<SchemaMode>,
    pub policy: Option<ExportPolicy>,
    pub annex_gzip: Option<bool>,
}

/// `aiop:` section of `osiris.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
struct FilePolicy {
    #[serde(default)]
    max_core_bytes: Option<usize>,
    #[serde(default)]
    timeline_density: Option<TimelineDensity>,
    #[serde(default)]
    metrics_topk: Option<usize>,
    #[serde(default)]
    schema_mode: Option<SchemaMode>,
    #[serde(default)]
    policy: Option<ExportPolicy>,
    #[serde(default)]
    annex_gzip: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    aiop: FilePolicy,
}

impl AiopPolicy {
    /// Layered resolution. `env` is injectable for tests; production passes
    /// `&std::env::var` semantics via `from_process_env`.
    pub fn resolve(
        cli: &PolicyOverrides,
        env: &dyn Fn(&str) -> Option<String>,
        config_file: Option<&Path>,
    ) -> Self {
        let mut policy = AiopPolicy::default();

        // 3) config file
        if let Some(path) = config_file {
            if let Ok(text) = std::fs::read_to_string(path) {
                match serde_yaml::from_str::<ConfigFile>(&text) {
                    Ok(file) => apply_file(&mut policy, &file.aiop),
                    Err(e) => tracing::warn!(file = %path.display(), error = %e, "ignoring bad osiris.yaml"),
                }
            }
        }

        // 2) environment
        if let Some(v) = env(ENV_MAX_CORE_BYTES).and_then(|v| v.parse().ok()) {
            policy.max_core_bytes = v;
        }
        if let Some(v) = env(ENV_TIMELINE_DENSITY).as_deref().and_then(TimelineDensity::parse) {
            policy.timeline_density = v;
        }
        if let Some(v) = env(ENV_METRICS_TOPK).and_then(|v| v.parse().ok()) {
            policy.metrics_topk = v;
        }
        if let Some(v) = env(ENV_SCHEMA_MODE).as_deref().and_then(SchemaMode::parse) {
            policy.schema_mode = v;
        }

        // 1) CLI
        if let Some(v) = cli.max_core_bytes {
            policy.max_core_bytes = v;
        }
        if let Some(v) = cli.timeline_density {
            policy.timeline_density = v;
        }
        if let Some(v) = cli.metrics_topk {
            policy.metrics_topk = v;
        }
        if let Some(v) = cli.schema_mode {
            policy.schema_mode = v;
        }
        if let Some(v) = cli.policy {
            policy.policy = v;
        }
        if let Some(v) = cli.annex_gzip {
            policy.annex_gzip = v;
        }

        policy
    }

    pub fn from_process_env(cli: &PolicyOverrides, config_file: Option<&Path>) -> Self {
        AiopPolicy::resolve(cli, &|name| std::env::var(name).ok(), config_file)
    }
}

fn apply_file(policy: &mut AiopPolicy, file: &FilePolicy) {
    if let Some(v) = file.max_core_bytes {
        policy.max_core_bytes = v;
    }
    if let Some(v) = file.timeline_density {
        policy.timeline_density = v;
    }
    if let Some(v) = file.metrics_topk {
        policy.metrics_topk = v;
    }
    if let Some(v) = file.schema_mode {
        policy.schema_mode = v;
    }
    if let Some(v) = file.policy {
        policy.policy = v;
    }
    if let Some(v) = file.annex_gzip {
        policy.annex_gzip = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn defaults_hold_without_inputs() {
        let p = AiopPolicy::resolve(&PolicyOverrides::default(), &|_| None, None);
        assert_eq!(p, AiopPolicy::default());
    }

    #[test]
    fn precedence_cli_over_env_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("osiris.yaml");
        std::fs::write(
            &file,
            "aiop:\n  metrics_topk: 3\n  timeline_density: minimal\n  max_core_bytes: 1000\n",
        )
        .unwrap();

        let env: BTreeMap<String, String> = [
            (ENV_METRICS_TOPK.to_string(), "5".to_string()),
            (ENV_TIMELINE_DENSITY.to_string(), "verbose".to_string()),
        ]
        .into_iter()
        .collect();
        let env_fn = |name: &str| env.get(name).cloned();

        let cli = PolicyOverrides { metrics_topk: Some(7), ..PolicyOverrides::default() };
        let p = AiopPolicy::resolve(&cli, &env_fn, Some(&file));

        assert_eq!(p.metrics_topk, 7); // CLI beats env beats file
        assert_eq!(p.timeline_density, TimelineDensity::Verbose); // env beats file
        assert_eq!(p.max_core_bytes, 1000); // file beats default
    }

    #[test]
    fn bad_env_values_fall_through() {
        let env_fn = |name: &str| {
            (name == ENV_TIMELINE_DENSITY).then(|| "bogus".to_string())
        };
        let p = AiopPolicy::resolve(&PolicyOverrides::default(), &env_fn, None);
        assert_eq!(p.timeline_density, TimelineDensity::Medium);
    }
}
