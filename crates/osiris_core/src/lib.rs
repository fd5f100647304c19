//! crates/osiris_core/src/lib.rs
//! Core, I/O-free types shared by every other Osiris crate.
//!
//! - Validated string newtypes for ids and hashes (`ids`)
//! - The OML document model (`oml`)
//! - In-memory tabular values passed between steps (`table`)
//! - The event/metric telemetry model (`events`)
//! - The driver contract and registry (`driver`)
//! - Uniform secret redaction (`redact`)
//!
//! Nothing in this crate touches the filesystem, the network, or the
//! process environment; that discipline keeps the compiler and validator
//! pure and the runtime testable.

#![forbid(unsafe_code)]

pub mod driver;
pub mod events;
pub mod ids;
pub mod oml;
pub mod redact;
pub mod table;

/// Lightweight re-exports so downstream crates can do:
///   use osiris_core::prelude::*;
pub mod prelude {
    pub use crate::driver::{CancelToken, Driver, DriverError, DriverRegistry, DriverRequest, RunContext};
    pub use crate::events::{EventKind, MetricUnit};
    pub use crate::ids::{ConnectionRef, ManifestHash, ManifestShort, PipelineSlug, RunId, StepId};
    pub use crate::oml::{OmlDocument, OmlStep, StepMode};
    pub use crate::redact::Redactor;
    pub use crate::table::{StepInputs, StepOutputs, Table};
}
