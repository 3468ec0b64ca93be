//! The sequential step interpreter shared by pipelines and for-each.

use crate::cancellation::CancellationToken;
use crate::context::{DataMap, RunContext};
use crate::errors::StepflowError;
use crate::events::{
    EventSink, STEP_COMPLETED, STEP_FAILED, STEP_SKIPPED, STEP_STARTED,
};
use crate::observability::SpanTimer;
use crate::steps::{Step, StepResult};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};

/// Output key holding a skipped step's error message.
pub const SKIP_ERROR_KEY: &str = "_error";
/// Output key marking a skipped step.
pub const SKIP_MARKER_KEY: &str = "_skipped";

/// How a [`StepSequence`] reacts to a failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHandling {
    /// Return the error, annotated with the step name.
    Abort,
    /// Record the failure under the step and move on.
    Skip,
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineResult {
    /// Every reachable step ran.
    Completed,
    /// A step asked the run to halt.
    Stopped {
        /// The step that returned `stop`.
        step: String,
    },
}

impl PipelineResult {
    /// Returns true if a step halted the run.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

/// An ordered list of steps with jump-target resolution.
#[derive(Clone)]
pub struct StepSequence {
    steps: Vec<Arc<dyn Step>>,
}

impl StepSequence {
    /// Creates a sequence. Names should already be unique; see
    /// [`ensure_unique_names`].
    #[must_use]
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Self {
        Self { steps }
    }

    /// Returns the steps in order.
    #[must_use]
    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if there are no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the position of the first step called `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name)
    }

    /// Runs the steps against `ctx`.
    ///
    /// Each successful step's output is merged into the context. A result
    /// with `stop` ends the run after merging; otherwise `next_step` moves
    /// execution to the named step, forward or backward, and without one the
    /// next position runs. Jump cycles are not detected.
    ///
    /// `label` names the owner (pipeline or composite step) in logs, events
    /// and cancellation errors.
    ///
    /// # Errors
    ///
    /// Returns a cancellation error if `signal` is cancelled before a step,
    /// [`StepflowError::JumpTargetNotFound`] for an unknown target, and the
    /// step's error wrapped in [`StepflowError::StepFailed`] when a step fails
    /// and `handling` is [`FailureHandling::Abort`]. Cancellation and
    /// control-flow errors abort even under [`FailureHandling::Skip`].
    pub async fn run(
        &self,
        signal: &CancellationToken,
        ctx: &mut RunContext,
        handling: FailureHandling,
        sink: &dyn EventSink,
        label: &str,
    ) -> Result<PipelineResult, StepflowError> {
        let mut position = 0;

        while let Some(step) = self.steps.get(position) {
            let name = step.name();

            if signal.is_cancelled() {
                return Err(StepflowError::cancelled(format!(
                    "pipeline {label:?} cancelled before step {name:?}: {}",
                    signal.reason().unwrap_or_default()
                )));
            }

            sink.try_emit(
                STEP_STARTED,
                Some(json!({"pipeline": label, "step": name, "index": position})),
            );

            let timer = SpanTimer::start(name);
            let span = info_span!("step", pipeline = %label, step = %name, index = position);
            let outcome = step.execute(signal, ctx).instrument(span).await;
            let elapsed_ms = timer.finish();

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    let fatal = e.is_cancellation() || e.is_control_flow();
                    if fatal || handling == FailureHandling::Abort {
                        error!(pipeline = %label, step = %name, error = %e, elapsed_ms, "Step failed");
                        sink.try_emit(
                            STEP_FAILED,
                            Some(json!({
                                "pipeline": label,
                                "step": name,
                                "error": e.to_string(),
                                "elapsed_ms": elapsed_ms,
                            })),
                        );
                        return Err(StepflowError::step_failed(name, e));
                    }

                    warn!(pipeline = %label, step = %name, error = %e, "Step failed, skipping");
                    let message = e.to_string();
                    ctx.record_step_output(name, skip_marker(&message));
                    sink.try_emit(
                        STEP_SKIPPED,
                        Some(json!({"pipeline": label, "step": name, "error": message})),
                    );
                    position += 1;
                    continue;
                }
            };

            let StepResult {
                output,
                stop,
                next_step,
            } = result;
            ctx.merge_step_output(name, output);
            debug!(pipeline = %label, step = %name, elapsed_ms, "Step completed");
            sink.try_emit(
                STEP_COMPLETED,
                Some(json!({"pipeline": label, "step": name, "elapsed_ms": elapsed_ms})),
            );

            if stop {
                return Ok(PipelineResult::Stopped {
                    step: name.to_string(),
                });
            }

            position = match next_step {
                Some(target) => match self.position(&target) {
                    Some(index) => {
                        debug!(pipeline = %label, step = %name, target = %target, "Jumping");
                        index
                    }
                    None => {
                        return Err(StepflowError::JumpTargetNotFound {
                            step: name.to_string(),
                            target,
                        })
                    }
                },
                None => position + 1,
            };
        }

        Ok(PipelineResult::Completed)
    }
}

impl fmt::Debug for StepSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.steps.iter()).finish()
    }
}

fn skip_marker(message: &str) -> DataMap {
    DataMap::from([
        (SKIP_ERROR_KEY.to_string(), json!(message)),
        (SKIP_MARKER_KEY.to_string(), json!(true)),
    ])
}

/// Checks that no two steps share a name.
///
/// # Errors
///
/// Returns a message naming the first duplicate.
pub fn ensure_unique_names(steps: &[Arc<dyn Step>]) -> Result<(), String> {
    let mut seen = HashSet::with_capacity(steps.len());
    for step in steps {
        if !seen.insert(step.name()) {
            return Err(format!("duplicate step name {:?}", step.name()));
        }
    }
    Ok(())
}
