//! Compiled manifest types and the hash-elision finalization step.
//!
//! The fingerprint contract, in one place:
//! - Serialize the manifest **without** `meta.manifest_hash` (and the
//!   derived `meta.manifest_short`, which cannot exist before the hash) to
//!   canonical YAML bytes.
//! - `manifest_hash` = lowercase 64-hex SHA-256 of those bytes. No prefix.
//! - Inject `manifest_hash`/`manifest_short` into `meta` and re-render.
//!
//! Removing the hash fields before hashing is the ONLY way the hash is ever
//! computed; `verify_hash` recomputes by exactly that rule.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use osiris_core::ids::ManifestHash;
use osiris_core::oml::StepMode;
use osiris_io::canonical::to_canonical_yaml;
use osiris_io::hasher::sha256_hex;

use crate::CompileError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMeta {
    /// RFC 3339 UTC with `Z` suffix; an explicit compiler input, never
    /// sampled inside the compiler.
    pub generated_at: String,
    pub manifest_hash: String,
    pub manifest_short: String,
    pub oml_version: String,
    pub profile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPipeline {
    /// The pipeline slug (directory-safe identity).
    pub id: String,
    /// The authored OML name, verbatim.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestStep {
    pub id: String,
    pub component: String,
    pub mode: StepMode,
    /// Driver registry key (from the component's `x-runtime.driver`).
    pub driver: String,
    /// Canonical config file, relative to the manifest directory.
    pub config_path: String,
    /// Resolved upstream step ids (needs ∪ input references), sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    /// Symbolic connection reference ("@family.alias"); resolution happens
    /// at execution time, never here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    /// Logical input name → "${upstream.output}" reference.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub inputs: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub meta: ManifestMeta,
    pub pipeline: ManifestPipeline,
    pub steps: Vec<ManifestStep>,
}

/// The manifest before fingerprinting: same shape minus the hash fields.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ManifestNoHash<'a> {
    pub meta: MetaNoHash<'a>,
    pub pipeline: &'a ManifestPipeline,
    pub steps: &'a [ManifestStep],
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MetaNoHash<'a> {
    pub generated_at: &'a str,
    pub oml_version: &'a str,
    pub profile: &'a str,
}

/// Inputs to finalization; everything already canonicalized by the compiler.
pub(crate) struct ManifestDraft {
    pub generated_at: String,
    pub oml_version: String,
    pub profile: String,
    pub pipeline: ManifestPipeline,
    pub steps: Vec<ManifestStep>,
}

/// NoHash → WithHash: compute the fingerprint over the hash-elided canonical
/// bytes, then inject it.
pub(crate) fn finalize_manifest(draft: ManifestDraft) -> Result<(Manifest, ManifestHash), CompileError> {
    let no_hash = ManifestNoHash {
        meta: MetaNoHash {
            generated_at: &draft.generated_at,
            oml_version: &draft.oml_version,
            profile: &draft.profile,
        },
        pipeline: &draft.pipeline,
        steps: &draft.steps,
    };
    let bytes = to_canonical_yaml(&no_hash)?;
    let hex = sha256_hex(bytes.as_bytes());
    let hash: ManifestHash = hex
        .parse()
        .map_err(|e| CompileError::Canonicalization(format!("bad digest shape: {e}")))?;

    let manifest = Manifest {
        meta: ManifestMeta {
            generated_at: draft.generated_at,
            manifest_hash: hash.as_hex().to_owned(),
            manifest_short: hash.short().as_str().to_owned(),
            oml_version: draft.oml_version,
            profile: draft.profile,
        },
        pipeline: draft.pipeline,
        steps: draft.steps,
    };
    Ok((manifest, hash))
}

/// Recompute the fingerprint of a loaded manifest value by eliding the hash
/// fields; true iff it matches `meta.manifest_hash`.
pub fn verify_hash(manifest_value: &Value) -> Result<bool, CompileError> {
    let declared = manifest_value
        .pointer("/meta/manifest_hash")
        .and_then(Value::as_str)
        .ok_or_else(|| CompileError::Canonicalization("manifest has no meta.manifest_hash".into()))?
        .to_owned();

    let mut elided = manifest_value.clone();
    let meta = elided
        .pointer_mut("/meta")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| CompileError::Canonicalization("manifest has no meta mapping".into()))?;
    meta.remove("manifest_hash");
    meta.remove("manifest_short");

    let bytes = osiris_io::canonical::to_canonical_yaml_string(&elided)?;
    Ok(sha256_hex(bytes.as_bytes()) == declared)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> ManifestDraft {
        ManifestDraft {
            generated_at: "2025-08-01T12:00:00Z".into(),
            oml_version: "0.1.0".into(),
            profile: "default".into(),
            pipeline: ManifestPipeline { id: "orders".into(), name: "Orders".into() },
            steps: vec![ManifestStep {
                id: "extract".into(),
                component: "db.extractor".into(),
                mode: StepMode::Read,
                driver: "memory.extractor".into(),
                config_path: "steps/extract.yaml".into(),
                needs: vec![],
                connection: Some("@mysql.main".into()),
                inputs: Default::default(),
            }],
        }
    }

    #[test]
    fn finalize_is_deterministic() {
        let (m1, h1) = finalize_manifest(draft()).unwrap();
        let (m2, h2) = finalize_manifest(draft()).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(to_canonical_yaml(&m1).unwrap(), to_canonical_yaml(&m2).unwrap());
        assert_eq!(m1.meta.manifest_short, h1.short().as_str());
        assert_eq!(m1.meta.manifest_hash.len(), 64);
        assert!(!m1.meta.manifest_hash.contains(':'));
    }

    #[test]
    fn hash_roundtrips_through_verify() {
        let (manifest, _) = finalize_manifest(draft()).unwrap();
        let value = serde_json::to_value(&manifest).unwrap();
        assert!(verify_hash(&value).unwrap());

        let mut tampered = value;
        tampered["pipeline"]["name"] = serde_json::json!("Tampered");
        assert!(!verify_hash(&tampered).unwrap());
    }

    #[test]
    fn different_content_different_hash() {
        let (_, h1) = finalize_manifest(draft()).unwrap();
        let mut d2 = draft();
        d2.steps[0].connection = Some("@mysql.replica".into());
        let (_, h2) = finalize_manifest(d2).unwrap();
        assert_ne!(h1, h2);
    }
}
