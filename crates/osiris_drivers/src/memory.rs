//! `memory.extractor`: a deterministic extractor whose rows come from the
//! step config itself. The fixture backbone of every engine test, and the
//! driver binding used by test-only component specs such as `db.extractor`.

use serde_json::{Map as JsonMap, Number, Value};

use osiris_core::driver::{Driver, DriverError, DriverRequest};
use osiris_core::events::{MetricUnit, METRIC_ROWS_READ};
use osiris_core::table::{StepOutputs, Table};

/// Default logical output name for tabular data.
pub const DEFAULT_OUTPUT: &str = "df";

pub struct MemoryExtractorDriver;

impl Driver for MemoryExtractorDriver {
    fn run(&self, req: DriverRequest<'_>) -> Result<StepOutputs, DriverError> {
        let rows = req
            .config
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| DriverError::Config("memory.extractor requires 'rows' (array of objects)".into()))?;
        let output = req
            .config
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_OUTPUT);

        let table = Table::from_values(rows.clone())
            .map_err(|e| DriverError::Config(e.to_string()))?;

        if req.ctx.is_cancelled() {
            return Err(DriverError::Cancelled);
        }

        let mut tags = JsonMap::new();
        tags.insert("step".into(), Value::String(req.step_id.to_string()));
        req.ctx.log_metric(METRIC_ROWS_READ, Number::from(table.len() as u64), MetricUnit::Rows, tags);

        let mut outputs = StepOutputs::new();
        outputs.insert(output.to_owned(), std::sync::Arc::new(table));
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestCtx;
    use osiris_core::table::StepInputs;
    use serde_json::json;

    #[test]
    fn extracts_rows_and_emits_rows_read() {
        let ctx = TestCtx::default();
        let config = json!({"rows": [{"id": 1}, {"id": 2}, {"id": 3}]})
            .as_object()
            .unwrap()
            .clone();
        let step = "extract".parse().unwrap();
        let inputs = StepInputs::new();

        let outputs = MemoryExtractorDriver
            .run(DriverRequest { step_id: &step, config: &config, inputs: &inputs, ctx: &ctx })
            .unwrap();

        assert_eq!(outputs[DEFAULT_OUTPUT].len(), 3);
        let (value, tags) = ctx.metric(METRIC_ROWS_READ).unwrap();
        assert_eq!(value.as_u64(), Some(3));
        assert_eq!(tags["step"], "extract");
    }

    #[test]
    fn missing_rows_is_a_config_error() {
        let ctx = TestCtx::default();
        let config = serde_json::Map::new();
        let step = "extract".parse().unwrap();
        let inputs = StepInputs::new();
        let err = MemoryExtractorDriver
            .run(DriverRequest { step_id: &step, config: &config, inputs: &inputs, ctx: &ctx })
            .unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }
}
