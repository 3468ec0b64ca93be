//! Retry a nested step with exponential backoff.
//!
//! The delay before retry `k + 1` is `min(max_delay, initial_delay * multiplier^k)`,
//! optionally jittered. Sleeps watch the cancellation token.

use super::config::{parse_config, ConfigDuration};
use super::spec::build_nested;
use super::{RegistryProvider, Services, Step, StepConfig, StepResult, StepSpec};
use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::errors::StepflowError;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Registered type of the retry step.
pub const RETRY_STEP_TYPE: &str = "step.retry_with_backoff";

/// Output key holding the number of retries a successful call needed.
pub const RETRY_ATTEMPTS_KEY: &str = "retry_attempts";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Jitter strategy applied to backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed delay as is.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

/// Backoff settings for a retry step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackoffPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: DEFAULT_MULTIPLIER,
            jitter: JitterStrategy::None,
        }
    }
}

impl BackoffPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of retries.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the multiplier. Non-positive values fall back to 2.0.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier > 0.0 {
            multiplier
        } else {
            DEFAULT_MULTIPLIER
        };
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts, counting the first.
    #[must_use]
    pub const fn max_attempts(&self) -> usize {
        self.max_retries as usize + 1
    }

    /// Delay after the failure of zero-based attempt `attempt`, before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let cap = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            return self.max_delay;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nanos = nanos.round() as u64;
        Duration::from_nanos(nanos)
    }

    /// Delay after the failure of zero-based attempt `attempt`, with jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        let jittered = match self.jitter {
            JitterStrategy::None => nanos,
            JitterStrategy::Full => {
                if nanos == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=nanos)
                }
            }
            JitterStrategy::Equal => {
                let half = nanos / 2;
                if half == 0 {
                    nanos
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_nanos(jittered)
    }
}

#[derive(Debug, Deserialize)]
struct RetryStepConfig {
    #[serde(default = "default_max_retries")]
    max_retries: i64,
    #[serde(default)]
    initial_delay: Option<ConfigDuration>,
    #[serde(default)]
    max_delay: Option<ConfigDuration>,
    #[serde(default)]
    multiplier: Option<f64>,
    #[serde(default)]
    jitter: JitterStrategy,
    step: StepSpec,
}

const fn default_max_retries() -> i64 {
    DEFAULT_MAX_RETRIES as i64
}

/// Runs a nested step until it succeeds or the retry budget is spent.
#[derive(Debug)]
pub struct RetryWithBackoffStep {
    name: String,
    policy: BackoffPolicy,
    step: Arc<dyn Step>,
}

impl RetryWithBackoffStep {
    /// Wraps a step with a backoff policy.
    #[must_use]
    pub fn new(name: impl Into<String>, step: Arc<dyn Step>, policy: BackoffPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            step,
        }
    }

    /// Returns the backoff policy.
    #[must_use]
    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Returns a factory that builds retry steps from configuration.
    ///
    /// Keys: `max_retries` (negative clamps to 0), `initial_delay`,
    /// `max_delay`, `multiplier`, `jitter` and the required nested `step`.
    pub fn factory(
        provider: RegistryProvider,
    ) -> impl Fn(&str, &StepConfig, &Services) -> Result<Arc<dyn Step>, StepflowError> + Send + Sync + 'static
    {
        move |name, config, services| {
            let cfg: RetryStepConfig = parse_config(RETRY_STEP_TYPE, name, config)?;
            let defaults = BackoffPolicy::default();
            let policy = BackoffPolicy::new()
                .with_max_retries(u32::try_from(cfg.max_retries.max(0)).unwrap_or(u32::MAX))
                .with_initial_delay(cfg.initial_delay.map_or(defaults.initial_delay, Into::into))
                .with_max_delay(cfg.max_delay.map_or(defaults.max_delay, Into::into))
                .with_multiplier(cfg.multiplier.unwrap_or(DEFAULT_MULTIPLIER))
                .with_jitter(cfg.jitter);
            let step = build_nested(&provider, RETRY_STEP_TYPE, name, "step", &cfg.step, services)?;
            Ok(Arc::new(Self::new(name, step, policy)) as Arc<dyn Step>)
        }
    }
}

#[async_trait]
impl Step for RetryWithBackoffStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        let attempts = self.policy.max_attempts();
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let retry = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
                let delay = self.policy.delay_for(retry);
                warn!(
                    step = %self.name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %last_error.as_ref().map_or_else(String::new, ToString::to_string),
                    "Retrying after error"
                );
                tokio::select! {
                    () = signal.cancelled() => {
                        return Err(StepflowError::cancelled(format!(
                            "retry_with_backoff step {:?}: cancelled after {attempt} attempts",
                            self.name
                        )));
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }

            match self.step.execute(signal, ctx).await {
                Ok(mut result) => {
                    debug!(step = %self.name, attempt, "Nested step succeeded");
                    result
                        .output
                        .insert(RETRY_ATTEMPTS_KEY.to_string(), attempt.into());
                    return Ok(result);
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        Err(StepflowError::RetryExhausted {
            step: self.name.clone(),
            nested: self.step.name().to_string(),
            attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| StepflowError::execution("no attempts were made")),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DataMap;
    use crate::steps::StepRegistry;
    use crate::testing::{FailingStep, FlakyStep, MockStep};
    use serde_json::json;

    fn config(value: serde_json::Value) -> StepConfig {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("config must be an object"),
        }
    }

    #[test]
    fn test_base_delay_sequence() {
        let policy = BackoffPolicy::new();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
        assert_eq!(policy.base_delay(5000), Duration::from_secs(30));
    }

    #[test]
    fn test_multiplier_fallback() {
        let policy = BackoffPolicy::new().with_multiplier(0.0);
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
        let policy = BackoffPolicy::new().with_multiplier(-3.0);
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_jitter_bounds() {
        let full = BackoffPolicy::new().with_jitter(JitterStrategy::Full);
        let equal = BackoffPolicy::new().with_jitter(JitterStrategy::Equal);
        for _ in 0..50 {
            assert!(full.delay_for(1) <= Duration::from_secs(2));
            let d = equal.delay_for(1);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_with_backoff() {
        let inner = Arc::new(FlakyStep::new("inner", 2));
        let step = RetryWithBackoffStep::new(
            "retry",
            inner.clone(),
            BackoffPolicy::new().with_initial_delay(Duration::from_millis(10)),
        );
        let mut ctx = RunContext::new(DataMap::new());

        let result = step
            .execute(&CancellationToken::new(), &mut ctx)
            .await
            .unwrap();

        assert_eq!(inner.call_count(), 3);
        assert_eq!(result.output.get(RETRY_ATTEMPTS_KEY), Some(&json!(2)));

        let calls = inner.call_times();
        assert_eq!(calls[1] - calls[0], Duration::from_millis(10));
        assert_eq!(calls[2] - calls[1], Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let inner = Arc::new(FailingStep::new("inner", "still broken"));
        let step = RetryWithBackoffStep::new(
            "retry",
            inner.clone(),
            BackoffPolicy::new().with_max_retries(2),
        );
        let mut ctx = RunContext::new(DataMap::new());

        let err = step
            .execute(&CancellationToken::new(), &mut ctx)
            .await
            .unwrap_err();

        assert_eq!(inner.call_count(), 3);
        assert!(matches!(err, StepflowError::RetryExhausted { attempts: 3, .. }));
        assert!(err.to_string().contains("nested step \"inner\" failed all 3 attempts: still broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_waits_full_backoff_between_attempts() {
        let inner = Arc::new(FlakyStep::new("inner", 10));
        let step = RetryWithBackoffStep::new(
            "retry",
            inner.clone(),
            BackoffPolicy::new().with_max_retries(3),
        );
        let mut ctx = RunContext::new(DataMap::new());

        let err = tokio_test::assert_err!(step.execute(&CancellationToken::new(), &mut ctx).await);

        assert_eq!(inner.call_count(), 4);
        assert!(matches!(err, StepflowError::RetryExhausted { attempts: 4, .. }));
        let calls = inner.call_times();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let inner = Arc::new(FailingStep::new("inner", "nope"));
        let step = RetryWithBackoffStep::new(
            "retry",
            inner.clone(),
            BackoffPolicy::new().with_max_retries(0),
        );
        let mut ctx = RunContext::new(DataMap::new());

        let err = step
            .execute(&CancellationToken::new(), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(inner.call_count(), 1);
        assert!(err.to_string().contains("failed all 1 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_is_not_exhaustion() {
        let inner = Arc::new(FailingStep::new("inner", "nope"));
        let step = RetryWithBackoffStep::new(
            "retry",
            inner.clone(),
            BackoffPolicy::new().with_initial_delay(Duration::from_secs(60)),
        );
        let signal = CancellationToken::new();
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel("shutdown");
        });

        let mut ctx = RunContext::new(DataMap::new());
        let err = step.execute(&signal, &mut ctx).await.unwrap_err();

        assert!(err.is_cancellation());
        assert!(err.to_string().contains("cancelled after 1 attempts"));
        assert_eq!(inner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_nested_cancellation_is_not_retried() {
        let inner = Arc::new(MockStep::new("inner"));
        inner.set_error(|| StepflowError::cancelled("upstream"));
        let step = RetryWithBackoffStep::new("retry", inner.clone(), BackoffPolicy::new());
        let mut ctx = RunContext::new(DataMap::new());

        let err = step
            .execute(&CancellationToken::new(), &mut ctx)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(inner.call_count(), 1);
    }

    #[test]
    fn test_factory_defaults_and_clamping() {
        let registry = StepRegistry::with_builtins();
        let step = registry
            .create(
                RETRY_STEP_TYPE,
                "r",
                &config(json!({
                    "max_retries": -4,
                    "multiplier": 0,
                    "initial_delay": "250ms",
                    "step": {"type": "step.set", "values": {}}
                })),
                &Services::new(),
            )
            .unwrap();
        let debug = format!("{step:?}");
        assert!(debug.contains("max_retries: 0"));
        assert!(debug.contains("multiplier: 2.0"));
        assert!(debug.contains("initial_delay: 250ms"));
        assert!(debug.contains("r-step"));
    }

    #[test]
    fn test_factory_requires_nested_step() {
        let registry = StepRegistry::with_builtins();
        let err = registry
            .create(RETRY_STEP_TYPE, "r", &config(json!({})), &Services::new())
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("step"));
    }

    #[test]
    fn test_factory_rejects_unknown_nested_type() {
        let registry = StepRegistry::with_builtins();
        let err = registry
            .create(
                RETRY_STEP_TYPE,
                "r",
                &config(json!({"step": {"type": "step.nope"}})),
                &Services::new(),
            )
            .unwrap_err();
        assert!(matches!(err, StepflowError::UnknownStepType { .. }));
    }
}
