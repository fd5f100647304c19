//! crates/osiris_core/src/events.rs
//! The session telemetry model: structured events and metrics, one JSON
//! object per JSONL line. Payload requirements per event kind are encoded
//! here so writers and tests share a single source of truth.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value};

/// Every event kind the engine emits. Local and remote execution emit the
/// same kinds; the two `sandbox_bootstrap_*` kinds are remote-only additive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    StepStart,
    ConnectionResolveStart,
    ConnectionResolveComplete,
    StepComplete,
    StepFailed,
    CleanupComplete,
    RunEnd,
    CancelRequested,
    SandboxBootstrapStart,
    SandboxBootstrapComplete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStart => "run_start",
            EventKind::StepStart => "step_start",
            EventKind::ConnectionResolveStart => "connection_resolve_start",
            EventKind::ConnectionResolveComplete => "connection_resolve_complete",
            EventKind::StepComplete => "step_complete",
            EventKind::StepFailed => "step_failed",
            EventKind::CleanupComplete => "cleanup_complete",
            EventKind::RunEnd => "run_end",
            EventKind::CancelRequested => "cancel_requested",
            EventKind::SandboxBootstrapStart => "sandbox_bootstrap_start",
            EventKind::SandboxBootstrapComplete => "sandbox_bootstrap_complete",
        }
    }

    /// Payload fields that must be present for this kind.
    pub fn required_payload(&self) -> &'static [&'static str] {
        match self {
            EventKind::RunStart => &["pipeline_id", "manifest_hash"],
            EventKind::StepStart => &["step_id", "driver"],
            EventKind::ConnectionResolveStart => &["step_id", "connection"],
            EventKind::ConnectionResolveComplete => &["step_id", "connection"],
            EventKind::StepComplete => &["step_id", "rows_processed", "duration_ms"],
            EventKind::StepFailed => &["step_id", "error", "error_type"],
            EventKind::CleanupComplete => &["total_rows", "duration_ms"],
            EventKind::RunEnd => &["status"],
            EventKind::CancelRequested => &[],
            EventKind::SandboxBootstrapStart => &[],
            EventKind::SandboxBootstrapComplete => &["duration_ms"],
        }
    }
}

/// Metric units. Closed set; anything else is a contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Rows,
    Ms,
    Bytes,
    Seconds,
    Files,
    Code,
    Calls,
}

impl MetricUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricUnit::Rows => "rows",
            MetricUnit::Ms => "ms",
            MetricUnit::Bytes => "bytes",
            MetricUnit::Seconds => "seconds",
            MetricUnit::Files => "files",
            MetricUnit::Code => "code",
            MetricUnit::Calls => "calls",
        }
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// ISO-8601 UTC with `Z` suffix.
    pub ts: String,
    pub session: String,
    pub event: EventKind,
    #[serde(flatten)]
    pub payload: JsonMap<String, Value>,
}

impl EventRecord {
    /// True iff every required payload field for this kind is present.
    pub fn payload_complete(&self) -> bool {
        self.event
            .required_payload()
            .iter()
            .all(|k| self.payload.contains_key(*k))
    }
}

/// One line of `metrics.jsonl`. Step-scoped metrics carry `tags.step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub ts: String,
    pub session: String,
    pub metric: String,
    pub value: Number,
    pub unit: MetricUnit,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub tags: JsonMap<String, Value>,
}

/// Required per-mode row metric names.
pub const METRIC_ROWS_READ: &str = "rows_read";
pub const METRIC_ROWS_WRITTEN: &str = "rows_written";
pub const METRIC_ROWS_PROCESSED: &str = "rows_processed";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kinds_render_snake_case() {
        let s = serde_json::to_string(&EventKind::StepComplete).unwrap();
        assert_eq!(s, "\"step_complete\"");
        assert_eq!(EventKind::StepComplete.as_str(), "step_complete");
    }

    #[test]
    fn payload_completeness() {
        let mut payload = JsonMap::new();
        payload.insert("step_id".into(), json!("extract"));
        payload.insert("driver".into(), json!("memory.extractor"));
        let rec = EventRecord {
            ts: "2025-08-01T12:00:00Z".into(),
            session: "run_20250801T120000Z_0a1b2c".into(),
            event: EventKind::StepStart,
            payload,
        };
        assert!(rec.payload_complete());

        let rec2 = EventRecord { event: EventKind::StepComplete, ..rec };
        assert!(!rec2.payload_complete());
    }

    #[test]
    fn records_flatten_payload() {
        let rec = EventRecord {
            ts: "2025-08-01T12:00:00Z".into(),
            session: "run_20250801T120000Z_0a1b2c".into(),
            event: EventKind::RunEnd,
            payload: {
                let mut m = JsonMap::new();
                m.insert("status".into(), json!("completed"));
                m
            },
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["event"], "run_end");
        assert_eq!(v["status"], "completed");
    }
}
