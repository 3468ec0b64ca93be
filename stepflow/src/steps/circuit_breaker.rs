//! Circuit breaker around a nested step, with an optional fallback.
//!
//! Admission decisions and state updates happen under one mutex per breaker;
//! the nested call itself runs with the lock released.

use super::config::{parse_config, ConfigDuration};
use super::spec::build_nested;
use super::{RegistryProvider, Services, Step, StepConfig, StepResult, StepSpec};
use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::errors::StepflowError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registered type of the circuit breaker step.
pub const CIRCUIT_BREAKER_STEP_TYPE: &str = "step.circuit_breaker";

/// Output key telling whether the call was served while the circuit was open.
pub const CIRCUIT_OPEN_KEY: &str = "circuit_breaker_open";

const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }
}

enum Admission {
    Call { trial: bool },
    Reject,
}

/// Releases the half-open trial slot if the trial never reports back,
/// e.g. because its future was dropped.
struct TrialGuard<'a> {
    state: &'a Mutex<BreakerState>,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().trial_in_flight = false;
        }
    }
}

#[derive(Debug, Deserialize)]
struct CircuitBreakerConfig {
    #[serde(default)]
    failure_threshold: Option<i64>,
    #[serde(default)]
    reset_timeout: Option<ConfigDuration>,
    step: StepSpec,
    #[serde(default)]
    fallback: Option<StepSpec>,
}

/// Guards a nested step, failing fast while the dependency looks unhealthy.
#[derive(Debug)]
pub struct CircuitBreakerStep {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    step: Arc<dyn Step>,
    fallback: Option<Arc<dyn Step>>,
    state: Mutex<BreakerState>,
}

impl CircuitBreakerStep {
    /// Creates a breaker around `step`.
    ///
    /// A threshold of zero is treated as one.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        step: Arc<dyn Step>,
        failure_threshold: u32,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            step,
            fallback: None,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Sets the step to run while the circuit rejects calls.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn Step>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Returns the current circuit state.
    ///
    /// An open circuit whose reset timeout has elapsed still reports `Open`
    /// until the next call moves it to half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Returns the number of consecutive failures recorded.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Returns a factory that builds breakers from configuration.
    ///
    /// Keys: `failure_threshold` (required, > 0), `reset_timeout` (default
    /// 60s), the required nested `step` and an optional `fallback`.
    pub fn factory(
        provider: RegistryProvider,
    ) -> impl Fn(&str, &StepConfig, &Services) -> Result<Arc<dyn Step>, StepflowError> + Send + Sync + 'static
    {
        move |name, config, services| {
            let cfg: CircuitBreakerConfig = parse_config(CIRCUIT_BREAKER_STEP_TYPE, name, config)?;
            let threshold = cfg
                .failure_threshold
                .filter(|t| *t > 0)
                .and_then(|t| u32::try_from(t).ok())
                .ok_or_else(|| {
                    StepflowError::config(
                        CIRCUIT_BREAKER_STEP_TYPE,
                        name,
                        "failure_threshold must be a positive integer",
                    )
                })?;
            let reset_timeout = cfg.reset_timeout.map_or(DEFAULT_RESET_TIMEOUT, Into::into);

            let step = build_nested(
                &provider,
                CIRCUIT_BREAKER_STEP_TYPE,
                name,
                "step",
                &cfg.step,
                services,
            )?;
            let mut breaker = Self::new(name, step, threshold, reset_timeout);
            if let Some(spec) = &cfg.fallback {
                let fallback = build_nested(
                    &provider,
                    CIRCUIT_BREAKER_STEP_TYPE,
                    name,
                    "fallback",
                    spec,
                    services,
                )?;
                breaker = breaker.with_fallback(fallback);
            }
            Ok(Arc::new(breaker) as Arc<dyn Step>)
        }
    }

    fn admit(&self) -> Admission {
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => Admission::Call { trial: false },
            CircuitState::Open => {
                let cooled_down = s
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.reset_timeout);
                if cooled_down {
                    info!(step = %self.name, "Circuit half-open, admitting trial call");
                    s.state = CircuitState::HalfOpen;
                    s.trial_in_flight = true;
                    Admission::Call { trial: true }
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    Admission::Reject
                } else {
                    s.trial_in_flight = true;
                    Admission::Call { trial: true }
                }
            }
        }
    }

    fn record_success(&self) {
        let mut s = self.state.lock();
        if s.state != CircuitState::Closed {
            info!(step = %self.name, "Circuit closed");
        }
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.trial_in_flight = false;
    }

    fn record_failure(&self, trial: bool) {
        let mut s = self.state.lock();
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.last_failure = Some(Instant::now());
        if trial {
            s.trial_in_flight = false;
        }
        if (trial || s.consecutive_failures >= self.failure_threshold)
            && s.state != CircuitState::Open
        {
            warn!(
                step = %self.name,
                consecutive_failures = s.consecutive_failures,
                "Circuit opened"
            );
            s.state = CircuitState::Open;
        }
    }

    async fn reject(
        &self,
        signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        let Some(fallback) = &self.fallback else {
            debug!(step = %self.name, "Circuit open, rejecting call");
            return Err(StepflowError::CircuitOpen {
                step: self.name.clone(),
            });
        };

        debug!(step = %self.name, fallback = %fallback.name(), "Circuit open, using fallback");
        match fallback.execute(signal, ctx).await {
            Ok(mut result) => {
                result.output.insert(CIRCUIT_OPEN_KEY.to_string(), true.into());
                Ok(result)
            }
            Err(e) => Err(StepflowError::FallbackFailed {
                step: self.name.clone(),
                fallback: fallback.name().to_string(),
                source: Box::new(e),
            }),
        }
    }
}

#[async_trait]
impl Step for CircuitBreakerStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        let trial = match self.admit() {
            Admission::Reject => return self.reject(signal, ctx).await,
            Admission::Call { trial } => trial,
        };

        let guard = TrialGuard {
            state: &self.state,
            armed: trial,
        };
        match self.step.execute(signal, ctx).await {
            Ok(mut result) => {
                guard.disarm();
                self.record_success();
                result.output.insert(CIRCUIT_OPEN_KEY.to_string(), false.into());
                Ok(result)
            }
            // not the dependency's fault; the guard frees the trial slot
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                guard.disarm();
                self.record_failure(trial);
                Err(StepflowError::NestedStepFailed {
                    kind: "circuit_breaker",
                    step: self.name.clone(),
                    nested: self.step.name().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DataMap;
    use crate::steps::StepRegistry;
    use crate::testing::{FailingStep, MockStep, SlowStep};
    use serde_json::json;

    fn ctx() -> RunContext {
        RunContext::new(DataMap::new())
    }

    async fn call(step: &CircuitBreakerStep) -> Result<StepResult, StepflowError> {
        step.execute(&CancellationToken::new(), &mut ctx()).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects() {
        let inner = Arc::new(FailingStep::new("dep", "500"));
        let breaker = CircuitBreakerStep::new("cb", inner.clone(), 3, Duration::from_secs(60));

        for _ in 0..3 {
            let err = call(&breaker).await.unwrap_err();
            assert!(err.to_string().contains("nested step \"dep\" failed: 500"));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.consecutive_failures(), 3);

        let err = call(&breaker).await.unwrap_err();
        assert!(matches!(err, StepflowError::CircuitOpen { .. }));
        assert_eq!(err.to_string(), "circuit_breaker step \"cb\": circuit is open");
        assert_eq!(inner.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_marks_output_open() {
        let inner = Arc::new(FailingStep::new("dep", "down"));
        let fallback = Arc::new(MockStep::new("cached"));
        fallback.set_output(StepResult::ok_value("source", "cache"));
        let breaker = CircuitBreakerStep::new("cb", inner.clone(), 1, Duration::from_secs(60))
            .with_fallback(fallback.clone());

        assert!(call(&breaker).await.is_err());
        let result = call(&breaker).await.unwrap();

        assert_eq!(result.output.get("source"), Some(&json!("cache")));
        assert_eq!(result.output.get(CIRCUIT_OPEN_KEY), Some(&json!(true)));
        assert_eq!(inner.call_count(), 1);
        assert_eq!(fallback.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_failure_is_reported() {
        let breaker = CircuitBreakerStep::new(
            "cb",
            Arc::new(FailingStep::new("dep", "down")),
            1,
            Duration::from_secs(60),
        )
        .with_fallback(Arc::new(FailingStep::new("backup", "also down")));

        assert!(call(&breaker).await.is_err());
        let err = call(&breaker).await.unwrap_err();
        assert!(err.to_string().contains("fallback \"backup\" failed: also down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let inner = Arc::new(MockStep::new("dep"));
        inner.set_error(|| StepflowError::execution("down"));
        let breaker = CircuitBreakerStep::new("cb", inner.clone(), 1, Duration::from_secs(10));

        assert!(call(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        inner.set_output(StepResult::ok_value("ok", true));

        let result = call(&breaker).await.unwrap();
        assert_eq!(result.output.get(CIRCUIT_OPEN_KEY), Some(&json!(false)));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let inner = Arc::new(FailingStep::new("dep", "down"));
        let breaker = CircuitBreakerStep::new("cb", inner.clone(), 2, Duration::from_secs(10));

        assert!(call(&breaker).await.is_err());
        assert!(call(&breaker).await.is_err());
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(call(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(inner.call_count(), 3);

        // the reset timeout restarts from the trial failure
        let err = call(&breaker).await.unwrap_err();
        assert!(matches!(err, StepflowError::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_while_half_open() {
        let slow = Arc::new(SlowStep::new("slow-dep", Duration::from_secs(5)));
        let breaker = Arc::new(CircuitBreakerStep::new(
            "cb",
            slow.clone(),
            1,
            Duration::from_secs(10),
        ));

        // start from an open circuit whose cool-down is about to elapse
        {
            let mut s = breaker.state.lock();
            s.state = CircuitState::Open;
            s.consecutive_failures = 1;
            s.last_failure = Some(Instant::now());
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        let trial = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move { call(&breaker).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let err = call(&breaker).await.unwrap_err();
        assert!(matches!(err, StepflowError::CircuitOpen { .. }));

        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(slow.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_does_not_count_as_failure() {
        let inner = Arc::new(MockStep::new("dep"));
        inner.set_error(|| StepflowError::cancelled("shutdown"));
        let breaker = CircuitBreakerStep::new("cb", inner.clone(), 1, Duration::from_secs(10));

        let err = call(&breaker).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_factory_requires_positive_threshold() {
        let registry = StepRegistry::with_builtins();
        for cfg in [
            json!({"step": {"type": "step.set"}}),
            json!({"failure_threshold": 0, "step": {"type": "step.set"}}),
            json!({"failure_threshold": -2, "step": {"type": "step.set"}}),
        ] {
            let serde_json::Value::Object(cfg) = cfg else { unreachable!() };
            let err = registry
                .create(CIRCUIT_BREAKER_STEP_TYPE, "cb", &cfg, &Services::new())
                .unwrap_err();
            assert!(err.to_string().contains("failure_threshold"));
        }
    }

    #[test]
    fn test_factory_builds_fallback() {
        let registry = StepRegistry::with_builtins();
        let serde_json::Value::Object(cfg) = json!({
            "failure_threshold": 2,
            "reset_timeout": "5s",
            "step": {"type": "step.set"},
            "fallback": {"type": "step.set", "name": "cached"}
        }) else {
            unreachable!()
        };
        let step = registry
            .create(CIRCUIT_BREAKER_STEP_TYPE, "cb", &cfg, &Services::new())
            .unwrap();
        let debug = format!("{step:?}");
        assert!(debug.contains("cb-step"));
        assert!(debug.contains("cached"));
        assert!(debug.contains("reset_timeout: 5s"));
    }
}
