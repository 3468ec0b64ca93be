//! Step contract, registry and the built-in step types.
//!
//! Steps are the units of work a pipeline runs in order. This module provides:
//! - the `Step` trait and `StepResult`
//! - `StepRegistry`, mapping type strings to factories
//! - `StepSpec`, the declarative form of a step inside a definition
//! - composite steps: retry with backoff, circuit breaker, for-each
//! - small leaf steps: set, log, conditional

mod builtin;
mod circuit_breaker;
mod config;
mod for_each;
mod registry;
mod result;
mod retry;
mod spec;

pub use builtin::{
    ConditionalStep, LogLevel, LogStep, SetStep, CONDITIONAL_STEP_TYPE, LOG_STEP_TYPE,
    SET_STEP_TYPE,
};
pub use circuit_breaker::{
    CircuitBreakerStep, CircuitState, CIRCUIT_BREAKER_STEP_TYPE, CIRCUIT_OPEN_KEY,
};
pub use config::{parse_config, parse_duration, ConfigDuration, DurationParseError};
pub use for_each::{ForEachStep, FOR_EACH_STEP_TYPE};
pub use registry::{RegistryProvider, Services, StepConfig, StepFactory, StepRegistry};
pub use result::StepResult;
pub use retry::{
    BackoffPolicy, JitterStrategy, RetryWithBackoffStep, RETRY_ATTEMPTS_KEY, RETRY_STEP_TYPE,
};
pub use spec::StepSpec;

use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::errors::StepflowError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline steps.
///
/// A step is built once per pipeline assembly with its configuration fixed,
/// then executed any number of times, possibly by concurrent runs. It must not
/// keep the context beyond the call. An `Err` means none of the step's output
/// is trusted.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Returns the name of the step.
    fn name(&self) -> &str;

    /// Executes the step.
    ///
    /// # Arguments
    ///
    /// * `signal` - Cancellation for the run; long waits should watch it
    /// * `ctx` - The run context
    async fn execute(
        &self,
        signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError>;
}

/// A simple function-based step.
pub struct FnStep<F>
where
    F: Fn(&mut RunContext) -> Result<StepResult, StepflowError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStep<F>
where
    F: Fn(&mut RunContext) -> Result<StepResult, StepflowError> + Send + Sync,
{
    /// Creates a new function-based step.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStep<F>
where
    F: Fn(&mut RunContext) -> Result<StepResult, StepflowError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(&mut RunContext) -> Result<StepResult, StepflowError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        (self.func)(ctx)
    }
}

/// A step that does nothing and returns an empty output.
#[derive(Debug, Clone)]
pub struct NoOpStep {
    name: String,
}

impl NoOpStep {
    /// Creates a new no-op step.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Step for NoOpStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _signal: &CancellationToken,
        _ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        Ok(StepResult::empty())
    }
}
