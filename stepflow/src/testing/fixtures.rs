//! Test fixtures for pipeline testing.

use serde_json::Value;

use crate::context::{DataMap, RunContext, RunMetadata};
use crate::steps::StepConfig;

/// Converts a JSON object into a data map. Anything else yields an empty map.
#[must_use]
pub fn data_map(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => DataMap::new(),
    }
}

/// Converts a JSON object into a step configuration. Anything else yields an
/// empty configuration.
#[must_use]
pub fn step_config(value: Value) -> StepConfig {
    match value {
        Value::Object(map) => map,
        _ => StepConfig::new(),
    }
}

/// A run context builder.
#[derive(Debug, Default)]
pub struct TestContext {
    /// Trigger data.
    pub trigger: DataMap,
    /// Metadata values.
    pub metadata: DataMap,
    /// Step outputs recorded before the run.
    pub step_outputs: Vec<(String, DataMap)>,
}

impl TestContext {
    /// Creates an empty test context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a trigger value.
    #[must_use]
    pub fn with_trigger(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.trigger.insert(key.into(), value.into());
        self
    }

    /// Adds a metadata value.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Records a step output, merging it into the working data as a prior
    /// step would have.
    #[must_use]
    pub fn with_step_output(mut self, step: impl Into<String>, output: Value) -> Self {
        self.step_outputs.push((step.into(), data_map(output)));
        self
    }

    /// Builds the run context.
    #[must_use]
    pub fn build(self) -> RunContext {
        let mut ctx = RunContext::new(self.trigger)
            .with_metadata(RunMetadata::from_values(self.metadata));
        for (step, output) in self.step_outputs {
            ctx.merge_step_output(step, output);
        }
        ctx
    }
}
