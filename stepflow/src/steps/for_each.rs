//! Run a list of nested steps once per element of a collection.

use super::config::parse_config;
use super::spec::build_nested;
use super::{RegistryProvider, Services, Step, StepConfig, StepResult, StepSpec};
use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::errors::StepflowError;
use crate::events::NoOpEventSink;
use crate::pipeline::{ensure_unique_names, FailureHandling, StepSequence};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Registered type of the for-each step.
pub const FOR_EACH_STEP_TYPE: &str = "step.foreach";

fn default_item_key() -> String {
    "item".to_string()
}

fn default_index_key() -> String {
    "index".to_string()
}

#[derive(Debug, Deserialize)]
struct ForEachConfig {
    collection: String,
    #[serde(default = "default_item_key")]
    item_key: String,
    #[serde(default = "default_index_key")]
    index_key: String,
    #[serde(default)]
    steps: Vec<StepSpec>,
}

/// Iterates a collection, running the nested steps in a fresh sub-context
/// per element.
///
/// Each sub-context starts from the parent's working data plus the element
/// (under `item_key`) and its position (under `index_key`). The nested steps
/// run in order with the same merge, stop and jump rules as a pipeline; the
/// first failure aborts the whole step. The output is `results`, one working
/// data map per element, and `count`.
#[derive(Debug)]
pub struct ForEachStep {
    name: String,
    collection: String,
    item_key: String,
    index_key: String,
    steps: StepSequence,
}

impl ForEachStep {
    /// Creates a for-each step over the value at `collection`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        steps: Vec<Arc<dyn Step>>,
    ) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            item_key: default_item_key(),
            index_key: default_index_key(),
            steps: StepSequence::new(steps),
        }
    }

    /// Sets the key the current element is stored under.
    #[must_use]
    pub fn with_item_key(mut self, key: impl Into<String>) -> Self {
        self.item_key = key.into();
        self
    }

    /// Sets the key the current position is stored under.
    #[must_use]
    pub fn with_index_key(mut self, key: impl Into<String>) -> Self {
        self.index_key = key.into();
        self
    }

    /// Returns a factory that builds for-each steps from configuration.
    ///
    /// Keys: `collection` (required path), `item_key`, `index_key` and
    /// `steps`, a list of nested step specs built immediately.
    pub fn factory(
        provider: RegistryProvider,
    ) -> impl Fn(&str, &StepConfig, &Services) -> Result<Arc<dyn Step>, StepflowError> + Send + Sync + 'static
    {
        move |name, config, services| {
            let cfg: ForEachConfig = parse_config(FOR_EACH_STEP_TYPE, name, config)?;
            if cfg.collection.trim().is_empty() {
                return Err(StepflowError::config(
                    FOR_EACH_STEP_TYPE,
                    name,
                    "collection must not be empty",
                ));
            }

            let steps = cfg
                .steps
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    build_nested(
                        &provider,
                        FOR_EACH_STEP_TYPE,
                        name,
                        &format!("steps-{i}"),
                        spec,
                        services,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            ensure_unique_names(&steps)
                .map_err(|message| StepflowError::config(FOR_EACH_STEP_TYPE, name, message))?;

            let step = Self::new(name, cfg.collection, steps)
                .with_item_key(cfg.item_key)
                .with_index_key(cfg.index_key);
            Ok(Arc::new(step) as Arc<dyn Step>)
        }
    }

    fn resolve_items(&self, ctx: &RunContext) -> Result<Vec<Value>, StepflowError> {
        match ctx.lookup(&self.collection) {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(StepflowError::execution(format!(
                "foreach step {:?}: collection {:?} is not a list (found {})",
                self.name,
                self.collection,
                value_kind(&other)
            ))),
            None => Err(StepflowError::execution(format!(
                "foreach step {:?}: collection {:?} not found",
                self.name, self.collection
            ))),
        }
    }
}

const fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl Step for ForEachStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        let items = self.resolve_items(ctx)?;
        let count = items.len();
        let mut results = Vec::with_capacity(count);

        for (index, item) in items.into_iter().enumerate() {
            if signal.is_cancelled() {
                return Err(StepflowError::cancelled(format!(
                    "foreach step {:?} cancelled at iteration {index}: {}",
                    self.name,
                    signal.reason().unwrap_or_default()
                )));
            }

            let mut sub = ctx.fork();
            sub.set(self.item_key.clone(), item);
            sub.set(self.index_key.clone(), index);

            self.steps
                .run(signal, &mut sub, FailureHandling::Abort, &NoOpEventSink, &self.name)
                .await
                .map_err(|e| StepflowError::IterationFailed {
                    step: self.name.clone(),
                    index,
                    source: Box::new(e),
                })?;
            debug!(step = %self.name, index, "Iteration completed");

            results.push(Value::Object(sub.into_current().into_iter().collect()));
        }

        Ok(StepResult::ok_value("results", results).with_value("count", count))
    }
}
