//! crates/osiris_io/src/lib.rs
//! Minimal, single-source-of-truth I/O crate.
//!
//! - No inline implementations: the **file modules** are the truth, this file
//!   only carries the shared error type and a small prelude.
//! - Shared error type (`IoError`) with `From` conversions used across modules.
//! - Public surface kept stable; details live in submodules.

#![forbid(unsafe_code)]

use thiserror::Error;

/// Unified error for osiris_io (used by canonical/hasher/schema/fs paths).
/// Module-specific failure surfaces (registry, connections, run index) keep
/// their own enums and convert into this one at crate boundaries when needed.
#[derive(Debug, Error, PartialEq)]
pub enum IoError {
    /// Filesystem / path errors (create_dir_all, rename, fsync, etc.)
    #[error("io/path error: {0}")]
    Path(String),

    /// JSON serialization/deserialization errors with an optional JSON Pointer.
    #[error("json error at {pointer}: {msg}")]
    Json { pointer: String, msg: String },

    /// YAML parse/render errors.
    #[error("yaml error: {0}")]
    Yaml(String),

    /// Hashing-related errors (bad hex shapes, normalization failures).
    #[error("hash error: {0}")]
    Hash(String),

    /// Schema-related errors (JSON Schema compile failures).
    #[error("schema error: {0}")]
    Schema(String),

    /// Generic validation / invariants.
    #[error("invalid: {0}")]
    Invalid(String),
}

pub type IoResult<T> = Result<T, IoError>;

/* ---------------- From conversions (used by file modules) ---------------- */

impl From<std::io::Error> for IoError {
    fn from(e: std::io::Error) -> Self {
        IoError::Path(e.to_string())
    }
}

impl From<serde_json::Error> for IoError {
    fn from(e: serde_json::Error) -> Self {
        // serde_json doesn't keep a pointer; default to root. Callers may
        // enrich this at higher layers.
        IoError::Json { pointer: "/".to_string(), msg: e.to_string() }
    }
}

impl From<serde_yaml::Error> for IoError {
    fn from(e: serde_yaml::Error) -> Self {
        IoError::Yaml(e.to_string())
    }
}

/* ---------------- Public modules (single source of truth) ---------------- */

pub mod canonical;
pub mod connections;
pub mod fs_contract;
pub mod hasher;
pub mod registry;
pub mod run_index;
pub mod schema;

/* ---------------- Public prelude ----------------
   Lightweight re-exports so downstream crates can do:
     use osiris_io::prelude::*;
------------------------------------------------- */

pub mod prelude {
    pub use crate::{IoError, IoResult};

    pub use crate::canonical::{to_canonical_bytes, to_canonical_json_bytes, to_canonical_yaml_string};
    pub use crate::connections::{ConnectionResolver, ConnectionsFile, EnvSource, ProcessEnv, ResolvedConnection};
    pub use crate::fs_contract::FilesystemContract;
    pub use crate::hasher::{normalize_manifest_hash, sha256_hex, short_hex};
    pub use crate::registry::{ComponentSpec, Registry, SpecValidationLevel};
    pub use crate::run_index::{RunIndexReader, RunIndexWriter, RunRecord, RunStatus};
    pub use crate::schema::CompiledSchema;
}
