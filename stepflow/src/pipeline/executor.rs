//! The pipeline orchestrator.

use super::{ErrorStrategy, FailureHandling, PipelineBuilder, PipelineResult, StepSequence};
use crate::cancellation::CancellationToken;
use crate::context::{DataMap, RunContext};
use crate::errors::{CompensationFailure, StepflowError};
use crate::events::{
    EventSink, EXECUTION_COMPLETED, EXECUTION_FAILED, EXECUTION_STARTED, EXECUTION_STOPPED,
    SAGA_COMPENSATED, SAGA_COMPENSATING, STEP_COMPENSATED, STEP_FAILED,
};
use crate::observability::SpanTimer;
use crate::steps::Step;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Metadata key holding the pipeline name.
pub const PIPELINE_KEY: &str = "pipeline";
/// Metadata key holding the RFC 3339 start time of the run.
pub const STARTED_AT_KEY: &str = "started_at";
/// Metadata key holding the RFC 3339 completion time of a successful run.
pub const COMPLETED_AT_KEY: &str = "completed_at";

/// A named, ordered list of steps plus the policy for running them.
///
/// Pipelines are immutable once built and can serve any number of
/// concurrent runs, each with its own [`RunContext`].
pub struct Pipeline {
    pub(super) name: String,
    pub(super) steps: StepSequence,
    pub(super) on_error: ErrorStrategy,
    pub(super) compensation: Vec<Arc<dyn Step>>,
    pub(super) timeout: Option<Duration>,
    pub(super) metadata: DataMap,
    pub(super) event_sink: Arc<dyn EventSink>,
}

impl Pipeline {
    /// Starts building a pipeline.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the steps in order.
    #[must_use]
    pub fn steps(&self) -> &[Arc<dyn Step>] {
        self.steps.steps()
    }

    /// Returns the error strategy.
    #[must_use]
    pub const fn on_error(&self) -> ErrorStrategy {
        self.on_error
    }

    /// Returns the compensation steps.
    #[must_use]
    pub fn compensation(&self) -> &[Arc<dyn Step>] {
        &self.compensation
    }

    /// Returns the run timeout, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the metadata copied into every run.
    #[must_use]
    pub const fn metadata(&self) -> &DataMap {
        &self.metadata
    }

    /// Runs the pipeline on a fresh context seeded from `trigger`.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::execute_with_context`].
    pub async fn execute(
        &self,
        signal: &CancellationToken,
        trigger: DataMap,
    ) -> Result<RunContext, StepflowError> {
        let mut ctx = RunContext::new(trigger);
        self.execute_with_context(signal, &mut ctx).await?;
        Ok(ctx)
    }

    /// Runs the pipeline and returns only the final working data.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::execute_with_context`].
    pub async fn run(
        &self,
        signal: &CancellationToken,
        trigger: DataMap,
    ) -> Result<DataMap, StepflowError> {
        self.execute(signal, trigger)
            .await
            .map(RunContext::into_current)
    }

    /// Runs the pipeline against a caller-supplied context.
    ///
    /// The context's metadata receives the pipeline metadata, the pipeline
    /// name and the start time; `completed_at` is added when the run does
    /// not fail. With a timeout configured, steps observe a child token that
    /// is cancelled at the deadline.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error (see [`StepSequence::run`]). Under
    /// [`ErrorStrategy::Compensate`] a step failure is returned as
    /// [`StepflowError::Compensated`] after every compensation step ran.
    pub async fn execute_with_context(
        &self,
        signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<PipelineResult, StepflowError> {
        let (signal, _deadline) = match self.timeout {
            Some(timeout) => {
                let (child, guard) = signal.child_with_timeout(timeout);
                (child, Some(guard))
            }
            None => (signal.clone(), None),
        };

        self.seed_metadata(ctx);
        let run_id = ctx.run_id().to_string();
        let timer = SpanTimer::start(&self.name);

        info!(pipeline = %self.name, run_id = %run_id, steps = self.steps.len(), "Pipeline started");
        self.event_sink.try_emit(
            EXECUTION_STARTED,
            Some(json!({"pipeline": self.name, "run_id": run_id})),
        );

        let handling = match self.on_error {
            ErrorStrategy::Skip => FailureHandling::Skip,
            ErrorStrategy::Stop | ErrorStrategy::Compensate => FailureHandling::Abort,
        };
        let outcome = self
            .steps
            .run(&signal, ctx, handling, self.event_sink.as_ref(), &self.name)
            .await;
        let elapsed_ms = timer.finish();

        match outcome {
            Ok(result) => {
                ctx.metadata_mut().insert(COMPLETED_AT_KEY, now());
                match &result {
                    PipelineResult::Completed => {
                        info!(pipeline = %self.name, run_id = %run_id, elapsed_ms, "Pipeline completed");
                        self.event_sink.try_emit(
                            EXECUTION_COMPLETED,
                            Some(json!({"pipeline": self.name, "run_id": run_id, "elapsed_ms": elapsed_ms})),
                        );
                    }
                    PipelineResult::Stopped { step } => {
                        info!(pipeline = %self.name, run_id = %run_id, step = %step, elapsed_ms, "Pipeline stopped");
                        self.event_sink.try_emit(
                            EXECUTION_STOPPED,
                            Some(json!({"pipeline": self.name, "run_id": run_id, "step": step})),
                        );
                    }
                }
                Ok(result)
            }
            Err(e) => {
                let e = if self.on_error == ErrorStrategy::Compensate
                    && !e.is_cancellation()
                    && !e.is_control_flow()
                {
                    self.compensate(&signal, ctx, e).await
                } else {
                    e
                };

                error!(pipeline = %self.name, run_id = %run_id, error = %e, elapsed_ms, "Pipeline failed");
                self.event_sink.try_emit(
                    EXECUTION_FAILED,
                    Some(json!({"pipeline": self.name, "run_id": run_id, "error": e.to_string()})),
                );
                Err(e)
            }
        }
    }

    fn seed_metadata(&self, ctx: &mut RunContext) {
        let metadata = ctx.metadata_mut();
        metadata.extend(&self.metadata);
        metadata.insert(PIPELINE_KEY, self.name.clone());
        metadata.insert(STARTED_AT_KEY, now());
    }

    /// Runs every compensation step once, last declared first.
    ///
    /// Outputs are merged; `stop` and `next_step` are ignored. Failures are
    /// collected and do not interrupt the remaining steps. The saga is only
    /// reported as compensated when every compensation step succeeded.
    async fn compensate(
        &self,
        signal: &CancellationToken,
        ctx: &mut RunContext,
        failure: StepflowError,
    ) -> StepflowError {
        let (step, source) = match failure {
            StepflowError::StepFailed { step, source } => (step, source),
            other => return other,
        };

        warn!(
            pipeline = %self.name,
            step = %step,
            compensation_steps = self.compensation.len(),
            "Running compensation"
        );
        self.event_sink.try_emit(
            SAGA_COMPENSATING,
            Some(json!({"pipeline": self.name, "failed_step": step})),
        );

        let mut compensation_failures = Vec::new();
        for compensation in self.compensation.iter().rev() {
            let name = compensation.name();
            match compensation.execute(signal, ctx).await {
                Ok(result) => {
                    ctx.merge_step_output(name, result.output);
                    self.event_sink.try_emit(
                        STEP_COMPENSATED,
                        Some(json!({"pipeline": self.name, "step": name})),
                    );
                }
                Err(e) => {
                    error!(pipeline = %self.name, step = %name, error = %e, "Compensation step failed");
                    self.event_sink.try_emit(
                        STEP_FAILED,
                        Some(json!({
                            "pipeline": self.name,
                            "step": name,
                            "step_type": "compensation",
                            "error": e.to_string(),
                        })),
                    );
                    compensation_failures.push(CompensationFailure {
                        step: name.to_string(),
                        error: e,
                    });
                }
            }
        }

        if compensation_failures.is_empty() {
            self.event_sink.try_emit(
                SAGA_COMPENSATED,
                Some(json!({"pipeline": self.name, "failed_step": step})),
            );
        } else {
            warn!(
                pipeline = %self.name,
                step = %step,
                failures = compensation_failures.len(),
                "Compensation incomplete"
            );
        }

        StepflowError::Compensated {
            step,
            source,
            compensation_failures,
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("on_error", &self.on_error)
            .field("compensation", &self.compensation)
            .field("timeout", &self.timeout)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
