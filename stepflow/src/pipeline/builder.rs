//! Pipeline builder with validation.

use super::sequence::ensure_unique_names;
use super::{ErrorStrategy, Pipeline, PipelineDefinition, StepSequence};
use crate::context::DataMap;
use crate::errors::StepflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::steps::{Services, Step, StepRegistry, StepSpec};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating validated pipelines.
#[derive(Clone)]
pub struct PipelineBuilder {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    on_error: ErrorStrategy,
    compensation: Vec<Arc<dyn Step>>,
    timeout: Option<Duration>,
    metadata: DataMap,
    event_sink: Arc<dyn EventSink>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            on_error: ErrorStrategy::default(),
            compensation: Vec::new(),
            timeout: None,
            metadata: DataMap::new(),
            event_sink: Arc::new(NoOpEventSink),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends several steps.
    #[must_use]
    pub fn steps(mut self, steps: impl IntoIterator<Item = Arc<dyn Step>>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Sets the error strategy.
    #[must_use]
    pub const fn on_error(mut self, strategy: ErrorStrategy) -> Self {
        self.on_error = strategy;
        self
    }

    /// Appends a compensation step.
    #[must_use]
    pub fn compensation(mut self, step: Arc<dyn Step>) -> Self {
        self.compensation.push(step);
        self
    }

    /// Sets the run timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a metadata value copied into every run.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of steps added so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`StepflowError::PipelineConfig`] if the name is blank, there
    /// are no steps, or two steps (or two compensation steps) share a name.
    pub fn build(self) -> Result<Pipeline, StepflowError> {
        let invalid = |message: String| StepflowError::PipelineConfig {
            pipeline: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("pipeline has no steps".to_string()));
        }
        ensure_unique_names(&self.steps).map_err(invalid)?;
        ensure_unique_names(&self.compensation)
            .map_err(|message| invalid(format!("compensation: {message}")))?;
        if self.timeout == Some(Duration::ZERO) {
            return Err(invalid("timeout must be positive".to_string()));
        }

        Ok(Pipeline {
            name: self.name,
            steps: StepSequence::new(self.steps),
            on_error: self.on_error,
            compensation: self.compensation,
            timeout: self.timeout,
            metadata: self.metadata,
            event_sink: self.event_sink,
        })
    }

    /// Assembles a builder from a definition, creating every step through
    /// `registry`.
    ///
    /// Steps without a name are called `<pipeline>-step-<i>`, compensation
    /// steps `<pipeline>-compensation-<i>`.
    ///
    /// # Errors
    ///
    /// Returns the first factory error, annotated with the pipeline name.
    pub fn from_definition(
        definition: &PipelineDefinition,
        registry: &StepRegistry,
        services: &Services,
    ) -> Result<Self, StepflowError> {
        let build_all = |specs: &[StepSpec], field: &str| {
            specs
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    spec.build(&format!("{}-{field}-{i}", definition.name), registry, services)
                        .map_err(|e| match e {
                            StepflowError::UnknownStepType { .. } => e,
                            other => StepflowError::PipelineConfig {
                                pipeline: definition.name.clone(),
                                message: other.to_string(),
                            },
                        })
                })
                .collect::<Result<Vec<_>, _>>()
        };

        let mut builder = Self::new(definition.name.clone())
            .steps(build_all(&definition.steps, "step")?)
            .on_error(definition.on_error);
        for step in build_all(&definition.compensation, "compensation")? {
            builder = builder.compensation(step);
        }
        if let Some(timeout) = definition.timeout {
            builder = builder.timeout(timeout.into());
        }
        builder.metadata.extend(definition.metadata.clone());
        Ok(builder)
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("on_error", &self.on_error)
            .field("compensation", &self.compensation)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::NoOpStep;

    #[test]
    fn test_build_single_step() {
        let pipeline = PipelineBuilder::new("orders")
            .step(Arc::new(NoOpStep::new("validate")))
            .metadata("team", "payments")
            .build()
            .unwrap();

        assert_eq!(pipeline.name(), "orders");
        assert_eq!(pipeline.steps().len(), 1);
        assert_eq!(pipeline.on_error(), ErrorStrategy::Stop);
        assert_eq!(pipeline.metadata().get("team"), Some(&serde_json::json!("payments")));
        assert!(pipeline.timeout().is_none());
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = PipelineBuilder::new("empty").build().unwrap_err();
        assert_eq!(err.to_string(), "pipeline \"empty\": pipeline has no steps");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = PipelineBuilder::new("p")
            .step(Arc::new(NoOpStep::new("a")))
            .step(Arc::new(NoOpStep::new("a")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate step name \"a\""));

        let err = PipelineBuilder::new("p")
            .step(Arc::new(NoOpStep::new("a")))
            .compensation(Arc::new(NoOpStep::new("undo")))
            .compensation(Arc::new(NoOpStep::new("undo")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("compensation: duplicate"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = PipelineBuilder::new("p")
            .step(Arc::new(NoOpStep::new("a")))
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_builder_accessors() {
        let builder = Pipeline::builder("p").steps(vec![
            Arc::new(NoOpStep::new("a")) as Arc<dyn Step>,
            Arc::new(NoOpStep::new("b")),
        ]);
        assert_eq!(builder.name(), "p");
        assert_eq!(builder.step_count(), 2);
    }
}
