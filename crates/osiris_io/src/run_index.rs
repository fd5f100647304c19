//! The run index: append-only JSONL files under `.osiris/index/` enabling
//! cross-run lookup by pipeline and by manifest hash.
//!
//! Invariants enforced here:
//! - `manifest_hash` in any appended record is pure lowercase 64-hex; a colon
//!   anywhere in the hash is rejected with `InvalidHashFormat`, never written.
//! - Appends are line-atomic (open-append-write-flush-close) under an
//!   advisory file lock, so concurrent runs interleave whole lines.
//! - Readers tolerate a torn trailing line by ignoring it; lookups normalize
//!   legacy hash inputs but only ever touch pure-hex filenames.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use osiris_core::ids::{is_hex64, ManifestHash, PipelineSlug, RunId};

use crate::canonical::to_canonical_bytes;
use crate::fs_contract::FilesystemContract;
use crate::hasher::normalize_manifest_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// One line of the run index. `manifest_hash` stays a plain string so legacy
/// lines deserialize for normalization; the writer enforces purity on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub pipeline_slug: PipelineSlug,
    pub manifest_hash: String,
    pub manifest_short: String,
    pub profile: String,
    /// RFC 3339 UTC, `Z` suffix.
    pub started_at: String,
    pub ended_at: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub total_rows: u64,
    /// Absolute paths.
    pub aiop_path: String,
    pub artifacts_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid manifest hash format: {0}")]
    InvalidHashFormat(String),
    #[error("corrupt index record: {0}")]
    CorruptRecord(String),
    #[error("index i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::Io(e.to_string())
    }
}

/// Appends run records to the global, per-pipeline, and per-manifest indexes.
pub struct RunIndexWriter {
    fsc: FilesystemContract,
}

impl RunIndexWriter {
    pub fn new(fsc: &FilesystemContract) -> Self {
        RunIndexWriter { fsc: fsc.clone() }
    }

    /// Append `record` to all three index files. Rejects impure hashes.
    pub fn append(&self, record: &RunRecord) -> Result<(), IndexError> {
        if record.manifest_hash.contains(':') {
            return Err(IndexError::InvalidHashFormat(format!(
                "manifest_hash must be pure hex, found ':' in {}",
                record.manifest_hash
            )));
        }
        if !is_hex64(&record.manifest_hash) {
            return Err(IndexError::InvalidHashFormat(format!(
                "manifest_hash must be lowercase 64-hex: {}",
                record.manifest_hash
            )));
        }
        let hash: ManifestHash = record
            .manifest_hash
            .parse()
            .map_err(|e| IndexError::InvalidHashFormat(format!("{e}")))?;

        let mut line = to_canonical_bytes(record).map_err(|e| IndexError::CorruptRecord(e.to_string()))?;
        line.push(b'\n');

        append_line(&self.fsc.runs_index_path().into_std_path_buf(), &line)?;
        append_line(
            &self.fsc.by_pipeline_index_path(&record.pipeline_slug).into_std_path_buf(),
            &line,
        )?;
        append_line(&self.fsc.by_manifest_index_path(&hash).into_std_path_buf(), &line)?;
        Ok(())
    }
}

/// One locked, line-atomic append.
fn append_line(path: &Path, line: &[u8]) -> Result<(), IndexError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.lock_exclusive()?;
    let res = f.write_all(line).and_then(|()| f.flush()).and_then(|()| f.sync_all());
    let _ = f.unlock();
    res?;
    Ok(())
}

/// Read-side of the index.
pub struct RunIndexReader {
    fsc: FilesystemContract,
}

impl RunIndexReader {
    pub fn new(fsc: &FilesystemContract) -> Self {
        RunIndexReader { fsc: fsc.clone() }
    }

    /// All records in the global index, oldest first.
    pub fn list_all(&self) -> Result<Vec<RunRecord>, IndexError> {
        read_records(&self.fsc.runs_index_path().into_std_path_buf())
    }

    /// Records for one manifest hash (legacy inputs normalized; the lookup
    /// itself touches only the pure-hex filename).
    pub fn for_manifest(&self, hash_input: &str) -> Result<Vec<RunRecord>, IndexError> {
        let pure = normalize_manifest_hash(hash_input)
            .map_err(|e| IndexError::InvalidHashFormat(e.to_string()))?;
        let hash: ManifestHash = pure
            .parse()
            .map_err(|e| IndexError::InvalidHashFormat(format!("{e}")))?;
        read_records(&self.fsc.by_manifest_index_path(&hash).into_std_path_buf())
    }

    /// The most recent *completed* run of the same manifest, excluding
    /// `current_run_id`. Records with legacy (prefixed) hashes still match
    /// after normalization.
    pub fn find_previous(
        &self,
        hash_input: &str,
        current_run_id: Option<&RunId>,
    ) -> Result<Option<RunRecord>, IndexError> {
        let pure = normalize_manifest_hash(hash_input)
            .map_err(|e| IndexError::InvalidHashFormat(e.to_string()))?;
        let records = self.for_manifest(&pure)?;
        // "Previous" means earlier in append order: when the current run is
        // already indexed, only records before it qualify.
        let cut = current_run_id
            .and_then(|id| records.iter().position(|r| &r.run_id == id))
            .unwrap_or(records.len());
        Ok(records[..cut]
            .iter()
            .rev()
            .find(|r| {
                r.status == RunStatus::Completed
                    && current_run_id.map(|id| &r.run_id != id).unwrap_or(true)
                    && normalize_manifest_hash(&r.manifest_hash).as_deref() == Ok(pure.as_str())
            })
            .cloned())
    }

    /// How many runs of this manifest are already recorded (for `run-<N>-…`
    /// AIOP directory ordinals).
    pub fn count_for_manifest(&self, hash_input: &str) -> Result<u64, IndexError> {
        Ok(self.for_manifest(hash_input)?.len() as u64)
    }

    /// Look a run up by id in the global index.
    pub fn find_by_run_id(&self, run_id: &RunId) -> Result<Option<RunRecord>, IndexError> {
        Ok(self.list_all()?.into_iter().rev().find(|r| &r.run_id == run_id))
    }

    /// The most recently appended run, if any.
    pub fn last_run(&self) -> Result<Option<RunRecord>, IndexError> {
        Ok(self.list_all()?.into_iter().next_back())
    }
}

/// Parse a JSONL index file, ignoring unparsable lines (a torn trailing line
/// from a crashed writer must not poison the index).
fn read_records(path: &Path) -> Result<Vec<RunRecord>, IndexError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(rec) = serde_json::from_str::<RunRecord>(line) {
            out.push(rec);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn record(run: &str, status: RunStatus) -> RunRecord {
        RunRecord {
            run_id: run.parse().unwrap(),
            pipeline_slug: "orders".parse().unwrap(),
            manifest_hash: HEX.into(),
            manifest_short: HEX[..7].into(),
            profile: "default".into(),
            started_at: "2025-08-01T12:00:00Z".into(),
            ended_at: "2025-08-01T12:00:05Z".into(),
            status,
            duration_ms: 5000,
            total_rows: 3,
            aiop_path: "/var/osiris/aiop/x".into(),
            artifacts_path: "/var/osiris/logs/x/artifacts".into(),
        }
    }

    fn contract(dir: &std::path::Path) -> FilesystemContract {
        FilesystemContract::from_std_path(dir).unwrap()
    }

    #[test]
    fn append_and_find_previous_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fsc = contract(dir.path());
        let writer = RunIndexWriter::new(&fsc);
        let reader = RunIndexReader::new(&fsc);

        let first = record("run_20250801T120000Z_aaaaaa", RunStatus::Completed);
        let second = record("run_20250801T130000Z_bbbbbb", RunStatus::Completed);
        writer.append(&first).unwrap();
        writer.append(&second).unwrap();

        let prev = reader
            .find_previous(HEX, Some(&second.run_id))
            .unwrap()
            .expect("first run should be found");
        assert_eq!(prev.run_id, first.run_id);
        assert_eq!(prev.manifest_hash, HEX);

        // The first run of a manifest has no previous run, even after later
        // runs were appended.
        assert!(reader.find_previous(HEX, Some(&first.run_id)).unwrap().is_none());
        assert_eq!(reader.count_for_manifest(HEX).unwrap(), 2);
        assert_eq!(reader.last_run().unwrap().unwrap().run_id, second.run_id);
    }

    #[test]
    fn writer_rejects_colon_and_impure_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RunIndexWriter::new(&contract(dir.path()));

        let mut bad = record("run_20250801T120000Z_aaaaaa", RunStatus::Completed);
        bad.manifest_hash = format!("sha256:{HEX}");
        assert!(matches!(writer.append(&bad), Err(IndexError::InvalidHashFormat(_))));

        bad.manifest_hash = "deadbeef".into();
        assert!(matches!(writer.append(&bad), Err(IndexError::InvalidHashFormat(_))));

        // Nothing was written.
        assert!(RunIndexReader::new(&contract(dir.path())).list_all().unwrap().is_empty());
    }

    #[test]
    fn failed_runs_are_not_previous_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let fsc = contract(dir.path());
        let writer = RunIndexWriter::new(&fsc);
        writer.append(&record("run_20250801T120000Z_aaaaaa", RunStatus::Failed)).unwrap();

        let reader = RunIndexReader::new(&fsc);
        assert!(reader.find_previous(HEX, None).unwrap().is_none());
    }

    #[test]
    fn legacy_prefixed_lookup_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let fsc = contract(dir.path());
        RunIndexWriter::new(&fsc)
            .append(&record("run_20250801T120000Z_aaaaaa", RunStatus::Completed))
            .unwrap();
        let reader = RunIndexReader::new(&fsc);
        let found = reader.find_previous(&format!("sha256:{HEX}"), None).unwrap();
        assert_eq!(found.unwrap().manifest_hash, HEX);
    }

    #[test]
    fn torn_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let fsc = contract(dir.path());
        RunIndexWriter::new(&fsc)
            .append(&record("run_20250801T120000Z_aaaaaa", RunStatus::Completed))
            .unwrap();

        // Simulate a crashed writer: half a JSON object, no newline.
        let mut f = OpenOptions::new()
            .append(true)
            .open(fsc.runs_index_path().as_std_path())
            .unwrap();
        f.write_all(b"{\"run_id\":\"run_2025").unwrap();

        let reader = RunIndexReader::new(&fsc);
        assert_eq!(reader.list_all().unwrap().len(), 1);
    }
}
