//! Error types for the stepflow kernel.
//!
//! Errors fall into a few families:
//! - configuration errors raised while assembling steps and pipelines
//! - execution failures raised by steps at run time
//! - control-flow errors raised by the orchestrator itself
//! - resilience outcomes (retry exhaustion, open circuit)
//! - cancellation, which always propagates

use thiserror::Error;

/// The main error type for stepflow operations.
#[derive(Debug, Error)]
pub enum StepflowError {
    /// A step's configuration could not be parsed or validated.
    #[error("{step_type} step {step:?}: {message}")]
    Config {
        /// The registered type of the step being built.
        step_type: String,
        /// The step name.
        step: String,
        /// What was wrong with the configuration.
        message: String,
    },

    /// A pipeline definition was invalid.
    #[error("pipeline {pipeline:?}: {message}")]
    PipelineConfig {
        /// The pipeline name.
        pipeline: String,
        /// What was wrong with the definition.
        message: String,
    },

    /// No factory is registered for a step type.
    #[error("unknown step type {step_type:?}")]
    UnknownStepType {
        /// The requested type.
        step_type: String,
    },

    /// A composite step could not reach its registry.
    #[error("{step_type} step {step:?}: registry not available")]
    RegistryUnavailable {
        /// The composite step type.
        step_type: String,
        /// The composite step name.
        step: String,
    },

    /// A leaf step failed.
    #[error("{0}")]
    Execution(String),

    /// A leaf step failed with an arbitrary error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// A step failed; wraps the step's error with its name.
    #[error("step {step:?} failed: {source}")]
    StepFailed {
        /// The failing step.
        step: String,
        /// The underlying error.
        source: Box<StepflowError>,
    },

    /// A step routed to a jump target that does not exist.
    #[error("step {step:?} routed to unknown step {target:?}")]
    JumpTargetNotFound {
        /// The step that produced the target.
        step: String,
        /// The unmatched target.
        target: String,
    },

    /// Every retry attempt failed.
    #[error(
        "retry_with_backoff step {step:?}: nested step {nested:?} failed all {attempts} attempts: {source}"
    )]
    RetryExhausted {
        /// The retry step.
        step: String,
        /// The wrapped step.
        nested: String,
        /// Total attempts made.
        attempts: usize,
        /// The last attempt's error.
        source: Box<StepflowError>,
    },

    /// A circuit breaker rejected the call and no fallback was configured.
    #[error("circuit_breaker step {step:?}: circuit is open")]
    CircuitOpen {
        /// The breaker step.
        step: String,
    },

    /// A composite step's nested step failed.
    #[error("{kind} step {step:?}: nested step {nested:?} failed: {source}")]
    NestedStepFailed {
        /// The composite type, e.g. `circuit_breaker`.
        kind: &'static str,
        /// The composite step.
        step: String,
        /// The nested step.
        nested: String,
        /// The nested error.
        source: Box<StepflowError>,
    },

    /// A circuit breaker's fallback failed.
    #[error("circuit_breaker step {step:?}: fallback {fallback:?} failed: {source}")]
    FallbackFailed {
        /// The breaker step.
        step: String,
        /// The fallback step.
        fallback: String,
        /// The fallback error.
        source: Box<StepflowError>,
    },

    /// One iteration of a for-each step failed.
    #[error("foreach step {step:?}: iteration {index}: {source}")]
    IterationFailed {
        /// The for-each step.
        step: String,
        /// Zero-based index of the failing element.
        index: usize,
        /// The sub-step failure.
        source: Box<StepflowError>,
    },

    /// A step failed under the compensate strategy.
    #[error("step {step:?} failed: {source} ({})", compensation_note(.compensation_failures))]
    Compensated {
        /// The step whose failure triggered compensation.
        step: String,
        /// The step failure that triggered compensation.
        source: Box<StepflowError>,
        /// Compensation steps that themselves failed.
        compensation_failures: Vec<CompensationFailure>,
    },

    /// Execution was cancelled.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why the run was cancelled.
        reason: String,
    },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A compensation step that failed while compensating.
#[derive(Debug)]
pub struct CompensationFailure {
    /// The compensation step name.
    pub step: String,
    /// Its error.
    pub error: StepflowError,
}

fn compensation_note(failures: &[CompensationFailure]) -> String {
    if failures.is_empty() {
        return "compensation executed".to_string();
    }
    let details: Vec<String> = failures
        .iter()
        .map(|f| format!("step {:?}: {}", f.step, f.error))
        .collect();
    format!("compensation executed; compensation also failed: {}", details.join("; "))
}

impl StepflowError {
    /// Creates an execution error from a message.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Creates a configuration error for a step.
    #[must_use]
    pub fn config(
        step_type: impl Into<String>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Config {
            step_type: step_type.into(),
            step: step.into(),
            message: message.into(),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Wraps an error with the name of the step that produced it.
    #[must_use]
    pub fn step_failed(step: impl Into<String>, source: Self) -> Self {
        Self::StepFailed {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Returns true if this error, or any error it wraps, is a cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            _ => self.wrapped().is_some_and(Self::is_cancellation),
        }
    }

    /// Returns true for orchestrator control-flow errors.
    ///
    /// These are never absorbed by the skip or compensate strategies.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        match self {
            Self::JumpTargetNotFound { .. } | Self::UnknownStepType { .. } => true,
            _ => self.wrapped().is_some_and(Self::is_control_flow),
        }
    }

    /// Returns true for errors raised while assembling steps or pipelines.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::PipelineConfig { .. }
                | Self::UnknownStepType { .. }
                | Self::RegistryUnavailable { .. }
        )
    }

    fn wrapped(&self) -> Option<&Self> {
        match self {
            Self::StepFailed { source, .. }
            | Self::NestedStepFailed { source, .. }
            | Self::FallbackFailed { source, .. }
            | Self::IterationFailed { source, .. }
            | Self::Compensated { source, .. } => Some(source),
            _ => None,
        }
    }
}
