//! crates/osiris_compiler/src/lib.rs
//! Compile-time half of the engine: the three-layer OML validator and the
//! deterministic OML → Manifest compiler.
//!
//! Both halves are pure with respect to the environment: the registry,
//! connections, and clock are explicit inputs, so compiling the same
//! document with the same inputs is byte-identical: the property everything
//! downstream (content addressing, delta analysis) stands on.

#![forbid(unsafe_code)]

use thiserror::Error;

pub mod compile;
pub mod manifest;
pub mod validate;

pub use compile::{compile, CompileOptions, CompiledPipeline};
pub use manifest::{Manifest, ManifestMeta, ManifestPipeline, ManifestStep};
pub use validate::{validate_oml, Severity, ValidationIssue, ValidationReport};

/// Compile-stage failure surface.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The document failed validation; the report carries the findings.
    #[error("validation failed: {} error(s)", .0.errors.len())]
    ValidationFailed(ValidationReport),

    #[error("registry lookup failed: {0}")]
    Registry(#[from] osiris_io::registry::RegistryError),

    #[error(transparent)]
    Io(#[from] osiris_io::IoError),

    #[error("canonicalization error: {0}")]
    Canonicalization(String),
}
