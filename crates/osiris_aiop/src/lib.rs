//! crates/osiris_aiop/src/lib.rs
//! AI Operation Package (AIOP) export.
//!
//! Pure offline post-run aggregation: callers hand in the run record and the
//! session/manifest paths; this crate reads them and renders
//! `summary.json` + `run-card.md` (+ optional NDJSON annex shards).
//!
//! Determinism rules (same posture as the engine's report layer):
//! - No wall-clock sampling anywhere in the document; every timestamp comes
//!   from the run's own files.
//! - Canonical JSON (sorted keys) for `summary.json`; two exports of the
//!   same run directory are byte-identical.
//! - Size bounding is a deterministic function of the inputs, with explicit
//!   truncation markers.

#![forbid(unsafe_code)]

use thiserror::Error;

pub mod export;
pub mod layers;
pub mod policy;

pub use export::{export, ExportInputs, ExportOutcome};
pub use policy::{AiopPolicy, ExportPolicy, SchemaMode, TimelineDensity};

#[derive(Debug, Error)]
pub enum AiopError {
    #[error(transparent)]
    Io(#[from] osiris_io::IoError),
    #[error("aiop i/o: {0}")]
    StdIo(String),
    #[error(transparent)]
    Index(#[from] osiris_io::run_index::IndexError),
    #[error("bad aiop input: {0}")]
    Input(String),
    /// Must never occur; a re-render of the same inputs diverged.
    #[error("aiop determinism mismatch: {0}")]
    DeterminismMismatch(String),
}

impl From<std::io::Error> for AiopError {
    fn from(e: std::io::Error) -> Self {
        AiopError::StdIo(e.to_string())
    }
}
