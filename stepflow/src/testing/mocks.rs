//! Mock steps for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cancellation::CancellationToken;
use crate::context::{DataMap, RunContext};
use crate::errors::StepflowError;
use crate::steps::{Step, StepResult};

type ErrorFactory = Arc<dyn Fn() -> StepflowError + Send + Sync>;

/// A mock step that records calls and returns a configurable result.
pub struct MockStep {
    name: String,
    output: Mutex<StepResult>,
    error: Mutex<Option<ErrorFactory>>,
    call_count: Mutex<usize>,
}

impl MockStep {
    /// Creates a new mock step returning an empty result.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Mutex::new(StepResult::empty()),
            error: Mutex::new(None),
            call_count: Mutex::new(0),
        }
    }

    /// Sets the result to return and clears any configured error.
    pub fn set_output(&self, output: StepResult) {
        *self.output.lock() = output;
        *self.error.lock() = None;
    }

    /// Makes every following call fail with the error `make` builds.
    pub fn set_error(&self, make: impl Fn() -> StepflowError + Send + Sync + 'static) {
        *self.error.lock() = Some(Arc::new(make));
    }

    /// Returns the number of times the step was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }

    /// Resets call tracking.
    pub fn reset(&self) {
        *self.call_count.lock() = 0;
    }
}

impl fmt::Debug for MockStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockStep")
            .field("name", &self.name)
            .field("call_count", &self.call_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for MockStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _signal: &CancellationToken,
        _ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        *self.call_count.lock() += 1;
        let error = self.error.lock().clone();
        match error {
            Some(make) => Err(make()),
            None => Ok(self.output.lock().clone()),
        }
    }
}

/// A step that always fails with an execution error.
#[derive(Debug)]
pub struct FailingStep {
    name: String,
    error: String,
    call_count: Mutex<usize>,
}

impl FailingStep {
    /// Creates a step failing with `error`.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
            call_count: Mutex::new(0),
        }
    }

    /// Returns the number of times the step was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }
}

#[async_trait]
impl Step for FailingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _signal: &CancellationToken,
        _ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        *self.call_count.lock() += 1;
        Err(StepflowError::execution(self.error.clone()))
    }
}

/// A step that fails a fixed number of times, then succeeds.
///
/// Succeeding calls output `attempt`, the 1-based call number.
#[derive(Debug)]
pub struct FlakyStep {
    name: String,
    failures: usize,
    calls: Mutex<Vec<Instant>>,
}

impl FlakyStep {
    /// Creates a step that fails its first `failures` calls.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: usize) -> Self {
        Self {
            name: name.into(),
            failures,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of times the step was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns when each call happened, on the Tokio clock.
    #[must_use]
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Step for FlakyStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _signal: &CancellationToken,
        _ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        let attempt = {
            let mut calls = self.calls.lock();
            calls.push(Instant::now());
            calls.len()
        };
        if attempt <= self.failures {
            Err(StepflowError::execution(format!("transient failure {attempt}")))
        } else {
            Ok(StepResult::ok_value("attempt", attempt))
        }
    }
}

/// A step that sleeps before succeeding, returning early if cancelled.
#[derive(Debug)]
pub struct SlowStep {
    name: String,
    delay: Duration,
    call_count: Mutex<usize>,
}

impl SlowStep {
    /// Creates a step that takes `delay` to finish.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            call_count: Mutex::new(0),
        }
    }

    /// Returns the number of times the step was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }
}

#[async_trait]
impl Step for SlowStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        signal: &CancellationToken,
        _ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        *self.call_count.lock() += 1;
        tokio::select! {
            () = signal.cancelled() => Err(StepflowError::cancelled(format!(
                "step {:?} interrupted: {}",
                self.name,
                signal.reason().unwrap_or_default()
            ))),
            () = tokio::time::sleep(self.delay) => Ok(StepResult::ok_value(
                "slept_ms",
                u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }
}

/// A step that records what it saw in the context on every call.
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    step_outputs: Mutex<Vec<HashMap<String, DataMap>>>,
    current: Mutex<Vec<DataMap>>,
}

impl RecordingStep {
    /// Creates a recording step. It outputs nothing.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_outputs: Mutex::new(Vec::new()),
            current: Mutex::new(Vec::new()),
        }
    }

    /// Returns the step outputs visible at each call.
    #[must_use]
    pub fn seen_step_outputs(&self) -> Vec<HashMap<String, DataMap>> {
        self.step_outputs.lock().clone()
    }

    /// Returns the working data visible at each call.
    #[must_use]
    pub fn seen_current(&self) -> Vec<DataMap> {
        self.current.lock().clone()
    }

    /// Returns the number of times the step was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.current.lock().len()
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        self.step_outputs.lock().push(ctx.step_outputs().clone());
        self.current.lock().push(ctx.current().clone());
        Ok(StepResult::empty())
    }
}
