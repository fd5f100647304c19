//! Remote transparent execution.
//!
//! - `protocol`: length-prefixed JSON frames and their classification
//! - `worker`: the sandbox-side serve loop (driver execution + streaming)
//! - `proxy`: the host-side channel, heartbeat watchdog, and run driver
//! - `sandbox`: package staging and worker-process launching
//!
//! Observation-layer transparency is the contract: the worker executes steps
//! through the same `execute_one_step` as the local runner and streams its
//! events/metrics back verbatim; the host merges them into the local session
//! with only session-id attribution and redaction reapplied.

pub mod protocol;
pub mod proxy;
pub mod sandbox;
pub mod worker;
