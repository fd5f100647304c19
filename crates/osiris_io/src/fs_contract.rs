//! The filesystem contract: every path the engine reads or writes is derived
//! here, as a pure function of `(base_path, profile, slug, short, hash,
//! run_id)`. No timestamps, no cwd, no platform branching in derivations.
//!
//! Layout (rooted at an absolute `base_path`):
//!   build/pipelines/<profile>/<slug>/<short>-<hash>/manifest.yaml
//!   build/pipelines/<profile>/<slug>/<short>-<hash>/steps/<step_id>.yaml
//!   .osiris/index/runs.jsonl
//!   .osiris/index/by_pipeline/<slug>.jsonl
//!   .osiris/index/by_manifest/<hash>.jsonl        (pure hex, no prefix)
//!   .osiris/index/latest/<slug>.txt
//!   aiop/<profile>/<slug>/<short>-<hash>/run-<N>-<run_id>/{summary.json,run-card.md,annex/}
//!   logs/<session_id>/{events.jsonl,metrics.jsonl,artifacts/}

use camino::{Utf8Path, Utf8PathBuf};

use osiris_core::ids::{ManifestHash, PipelineSlug, RunId, StepId};

use crate::IoError;

pub const MANIFEST_FILE: &str = "manifest.yaml";
pub const SUMMARY_FILE: &str = "summary.json";
pub const RUN_CARD_FILE: &str = "run-card.md";
pub const ANNEX_DIR: &str = "annex";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const METRICS_FILE: &str = "metrics.jsonl";
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Path derivation for one engine root. Cheap to clone; immutable.
#[derive(Debug, Clone)]
pub struct FilesystemContract {
    base: Utf8PathBuf,
}

impl FilesystemContract {
    /// `base` must be absolute: relative roots would make every derived path
    /// depend on the process cwd.
    pub fn new(base: impl Into<Utf8PathBuf>) -> Result<Self, IoError> {
        let base = base.into();
        if !base.is_absolute() {
            return Err(IoError::Invalid(format!("base_path must be absolute: {base}")));
        }
        Ok(FilesystemContract { base })
    }

    /// Convenience for `std::path` callers; the path must be valid UTF-8.
    pub fn from_std_path(base: &std::path::Path) -> Result<Self, IoError> {
        let utf8 = Utf8PathBuf::from_path_buf(base.to_path_buf())
            .map_err(|p| IoError::Invalid(format!("base_path is not UTF-8: {}", p.display())))?;
        FilesystemContract::new(utf8)
    }

    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    /* ---------------- build tree ---------------- */

    pub fn build_dir(&self, profile: &str, slug: &PipelineSlug, hash: &ManifestHash) -> Utf8PathBuf {
        self.base
            .join("build")
            .join("pipelines")
            .join(profile)
            .join(slug.as_str())
            .join(format!("{}-{}", hash.short(), hash.as_hex()))
    }

    pub fn manifest_path(&self, profile: &str, slug: &PipelineSlug, hash: &ManifestHash) -> Utf8PathBuf {
        self.build_dir(profile, slug, hash).join(MANIFEST_FILE)
    }

    pub fn steps_dir(&self, profile: &str, slug: &PipelineSlug, hash: &ManifestHash) -> Utf8PathBuf {
        self.build_dir(profile, slug, hash).join("steps")
    }

    pub fn step_config_path(
        &self,
        profile: &str,
        slug: &PipelineSlug,
        hash: &ManifestHash,
        step_id: &StepId,
    ) -> Utf8PathBuf {
        self.steps_dir(profile, slug, hash).join(format!("{step_id}.yaml"))
    }

    /* ---------------- run index ---------------- */

    pub fn index_dir(&self) -> Utf8PathBuf {
        self.base.join(".osiris").join("index")
    }

    pub fn runs_index_path(&self) -> Utf8PathBuf {
        self.index_dir().join("runs.jsonl")
    }

    pub fn by_pipeline_index_path(&self, slug: &PipelineSlug) -> Utf8PathBuf {
        self.index_dir().join("by_pipeline").join(format!("{slug}.jsonl"))
    }

    /// Pure-hex filename; the type makes a prefixed name unrepresentable.
    pub fn by_manifest_index_path(&self, hash: &ManifestHash) -> Utf8PathBuf {
        self.index_dir().join("by_manifest").join(format!("{}.jsonl", hash.as_hex()))
    }

    pub fn latest_pointer_path(&self, slug: &PipelineSlug) -> Utf8PathBuf {
        self.index_dir().join("latest").join(format!("{slug}.txt"))
    }

    /* ---------------- aiop tree ---------------- */

    pub fn aiop_manifest_dir(&self, profile: &str, slug: &PipelineSlug, hash: &ManifestHash) -> Utf8PathBuf {
        self.base
            .join("aiop")
            .join(profile)
            .join(slug.as_str())
            .join(format!("{}-{}", hash.short(), hash.as_hex()))
    }

    /// `run_seq` is the 1-based ordinal of this run among runs of the same
    /// manifest (derived from the by-manifest index, never from wall time).
    pub fn aiop_run_dir(
        &self,
        profile: &str,
        slug: &PipelineSlug,
        hash: &ManifestHash,
        run_seq: u64,
        run_id: &RunId,
    ) -> Utf8PathBuf {
        self.aiop_manifest_dir(profile, slug, hash)
            .join(format!("run-{run_seq}-{run_id}"))
    }

    /* ---------------- session logs ---------------- */

    pub fn session_dir(&self, run_id: &RunId) -> Utf8PathBuf {
        self.base.join("logs").join(run_id.as_str())
    }

    pub fn events_path(&self, run_id: &RunId) -> Utf8PathBuf {
        self.session_dir(run_id).join(EVENTS_FILE)
    }

    pub fn metrics_path(&self, run_id: &RunId) -> Utf8PathBuf {
        self.session_dir(run_id).join(METRICS_FILE)
    }

    pub fn artifacts_dir(&self, run_id: &RunId) -> Utf8PathBuf {
        self.session_dir(run_id).join(ARTIFACTS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn fsc() -> FilesystemContract {
        FilesystemContract::new("/var/osiris").unwrap()
    }

    fn hash() -> ManifestHash {
        HEX.parse().unwrap()
    }

    #[test]
    fn rejects_relative_base() {
        assert!(FilesystemContract::new("relative/dir").is_err());
    }

    #[test]
    fn build_paths_are_pure_and_timestamp_free() {
        let slug: PipelineSlug = "orders-to-csv".parse().unwrap();
        let dir = fsc().build_dir("default", &slug, &hash());
        assert_eq!(
            dir.as_str(),
            format!("/var/osiris/build/pipelines/default/orders-to-csv/0123456-{HEX}")
        );
        // Derivation is a pure function: same inputs, same path.
        assert_eq!(dir, fsc().build_dir("default", &slug, &hash()));

        let step: StepId = "extract".parse().unwrap();
        assert!(fsc()
            .step_config_path("default", &slug, &hash(), &step)
            .as_str()
            .ends_with("/steps/extract.yaml"));
    }

    #[test]
    fn by_manifest_filename_is_pure_hex() {
        let p = fsc().by_manifest_index_path(&hash());
        let fname = p.file_name().unwrap();
        assert_eq!(fname, format!("{HEX}.jsonl"));
        assert!(!fname.contains(':'));
    }

    #[test]
    fn aiop_and_session_paths() {
        let slug: PipelineSlug = "orders-to-csv".parse().unwrap();
        let run: RunId = "run_20250801T120000Z_0a1b2c".parse().unwrap();
        let dir = fsc().aiop_run_dir("default", &slug, &hash(), 2, &run);
        assert!(dir
            .as_str()
            .ends_with(&format!("aiop/default/orders-to-csv/0123456-{HEX}/run-2-{run}")));
        assert_eq!(
            fsc().events_path(&run).as_str(),
            format!("/var/osiris/logs/{run}/events.jsonl")
        );
    }
}
