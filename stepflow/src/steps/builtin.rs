//! Small leaf steps that ship with the kernel.

use super::config::parse_config;
use super::{Services, Step, StepConfig, StepResult};
use crate::cancellation::CancellationToken;
use crate::context::{DataMap, RunContext};
use crate::errors::StepflowError;
use crate::template::{PathTemplateResolver, TemplateResolver};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Registered type of [`SetStep`].
pub const SET_STEP_TYPE: &str = "step.set";
/// Registered type of [`LogStep`].
pub const LOG_STEP_TYPE: &str = "step.log";
/// Registered type of [`ConditionalStep`].
pub const CONDITIONAL_STEP_TYPE: &str = "step.conditional";

/// The resolver registered in `services`, or the path resolver.
fn resolver_from(services: &Services) -> Arc<dyn TemplateResolver> {
    services
        .get::<Arc<dyn TemplateResolver>>()
        .cloned()
        .unwrap_or_else(|| Arc::new(PathTemplateResolver::new()))
}

#[derive(Debug, Deserialize)]
struct SetConfig {
    #[serde(default)]
    values: DataMap,
}

/// Outputs a fixed set of values, resolving templates in string values.
#[derive(Debug)]
pub struct SetStep {
    name: String,
    values: DataMap,
    resolver: Arc<dyn TemplateResolver>,
}

impl SetStep {
    /// Creates a set step using the path template resolver.
    #[must_use]
    pub fn new(name: impl Into<String>, values: DataMap) -> Self {
        Self {
            name: name.into(),
            values,
            resolver: Arc::new(PathTemplateResolver::new()),
        }
    }

    /// Factory for [`SET_STEP_TYPE`]. Key: `values`.
    pub fn from_config(
        name: &str,
        config: &StepConfig,
        services: &Services,
    ) -> Result<Arc<dyn Step>, StepflowError> {
        let cfg: SetConfig = parse_config(SET_STEP_TYPE, name, config)?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            values: cfg.values,
            resolver: resolver_from(services),
        }))
    }
}

#[async_trait]
impl Step for SetStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        let output = self.resolver.resolve_map(&self.values, ctx)?;
        Ok(StepResult::ok(output))
    }
}

/// Log level for [`LogStep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    #[default]
    Info,
    /// Warn.
    Warn,
    /// Error.
    Error,
}

#[derive(Debug, Deserialize)]
struct LogConfig {
    message: String,
    #[serde(default)]
    level: LogLevel,
}

/// Writes a templated message to the log. Produces no output.
#[derive(Debug)]
pub struct LogStep {
    name: String,
    message: String,
    level: LogLevel,
    resolver: Arc<dyn TemplateResolver>,
}

impl LogStep {
    /// Creates a log step at info level.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            level: LogLevel::Info,
            resolver: Arc::new(PathTemplateResolver::new()),
        }
    }

    /// Sets the level.
    #[must_use]
    pub const fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Factory for [`LOG_STEP_TYPE`]. Keys: `message` (required), `level`.
    pub fn from_config(
        name: &str,
        config: &StepConfig,
        services: &Services,
    ) -> Result<Arc<dyn Step>, StepflowError> {
        let cfg: LogConfig = parse_config(LOG_STEP_TYPE, name, config)?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            message: cfg.message,
            level: cfg.level,
            resolver: resolver_from(services),
        }))
    }
}

#[async_trait]
impl Step for LogStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        let message = self.resolver.resolve(&self.message, ctx)?;
        let run_id = ctx.run_id();
        match self.level {
            LogLevel::Trace => trace!(step = %self.name, %run_id, "{message}"),
            LogLevel::Debug => debug!(step = %self.name, %run_id, "{message}"),
            LogLevel::Info => info!(step = %self.name, %run_id, "{message}"),
            LogLevel::Warn => warn!(step = %self.name, %run_id, "{message}"),
            LogLevel::Error => error!(step = %self.name, %run_id, "{message}"),
        }
        Ok(StepResult::empty())
    }
}

#[derive(Debug, Deserialize)]
struct ConditionalConfig {
    field: String,
    routes: HashMap<String, String>,
    #[serde(default)]
    default: Option<String>,
}

/// Routes to another step based on a field's value.
///
/// The value at `field` is looked up in `routes`; the matching step becomes
/// the jump target, or `default` when nothing matches. Output records the
/// `matched_value` and whether the default was `used_default`.
#[derive(Debug)]
pub struct ConditionalStep {
    name: String,
    field: String,
    routes: HashMap<String, String>,
    default: Option<String>,
}

impl ConditionalStep {
    /// Creates a conditional step.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        field: impl Into<String>,
        routes: HashMap<String, String>,
        default: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            routes,
            default,
        }
    }

    /// Factory for [`CONDITIONAL_STEP_TYPE`]. Keys: `field`, `routes`, `default`.
    pub fn from_config(
        name: &str,
        config: &StepConfig,
        _services: &Services,
    ) -> Result<Arc<dyn Step>, StepflowError> {
        let cfg: ConditionalConfig = parse_config(CONDITIONAL_STEP_TYPE, name, config)?;
        if cfg.field.trim().is_empty() {
            return Err(StepflowError::config(CONDITIONAL_STEP_TYPE, name, "field must not be empty"));
        }
        if cfg.routes.is_empty() && cfg.default.is_none() {
            return Err(StepflowError::config(
                CONDITIONAL_STEP_TYPE,
                name,
                "at least one route or a default is required",
            ));
        }
        Ok(Arc::new(Self::new(name, cfg.field, cfg.routes, cfg.default)))
    }
}

#[async_trait]
impl Step for ConditionalStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _signal: &CancellationToken,
        ctx: &mut RunContext,
    ) -> Result<StepResult, StepflowError> {
        let value = match ctx.lookup(&self.field) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        let (target, used_default) = match self.routes.get(&value) {
            Some(target) => (target.clone(), false),
            None => match &self.default {
                Some(target) => (target.clone(), true),
                None => {
                    return Err(StepflowError::execution(format!(
                        "conditional step {:?}: value {value:?} not found in routes and no default set",
                        self.name
                    )))
                }
            },
        };

        debug!(step = %self.name, value = %value, target = %target, "Routing");
        Ok(StepResult::ok_value("matched_value", value)
            .with_value("used_default", used_default)
            .with_next_step(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> StepConfig {
        match value {
            Value::Object(map) => map,
            _ => panic!("config must be an object"),
        }
    }

    fn ctx(value: Value) -> RunContext {
        RunContext::new(serde_json::from_value(value).unwrap())
    }

    #[tokio::test]
    async fn test_set_resolves_templates() {
        let step = SetStep::from_config(
            "greet",
            &config(json!({"values": {"msg": "hello {{ .name }}", "n": 1}})),
            &Services::new(),
        )
        .unwrap();

        let result = step
            .execute(&CancellationToken::new(), &mut ctx(json!({"name": "ada"})))
            .await
            .unwrap();
        assert_eq!(result.output.get("msg"), Some(&json!("hello ada")));
        assert_eq!(result.output.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_set_uses_resolver_from_services() {
        #[derive(Debug)]
        struct Shouting;
        impl TemplateResolver for Shouting {
            fn resolve(&self, template: &str, _ctx: &RunContext) -> Result<String, StepflowError> {
                Ok(template.to_uppercase())
            }
        }

        let services = Services::new().with(Arc::new(Shouting) as Arc<dyn TemplateResolver>);
        let step = SetStep::from_config("s", &config(json!({"values": {"m": "hi"}})), &services)
            .unwrap();
        let result = step
            .execute(&CancellationToken::new(), &mut ctx(json!({})))
            .await
            .unwrap();
        assert_eq!(result.output.get("m"), Some(&json!("HI")));
    }

    #[tokio::test]
    async fn test_log_requires_message() {
        let err = LogStep::from_config("l", &config(json!({})), &Services::new()).unwrap_err();
        assert!(err.is_config());

        let step = LogStep::from_config(
            "l",
            &config(json!({"message": "order {{ .id }}", "level": "warn"})),
            &Services::new(),
        )
        .unwrap();
        let result = step
            .execute(&CancellationToken::new(), &mut ctx(json!({"id": 5})))
            .await
            .unwrap();
        assert!(result.output.is_empty());
    }

    #[tokio::test]
    async fn test_conditional_routes_and_default() {
        let step = ConditionalStep::from_config(
            "route",
            &config(json!({
                "field": "order_type",
                "routes": {"express": "set-express", "standard": "set-standard"},
                "default": "set-standard"
            })),
            &Services::new(),
        )
        .unwrap();

        let result = step
            .execute(&CancellationToken::new(), &mut ctx(json!({"order_type": "express"})))
            .await
            .unwrap();
        assert_eq!(result.next_step.as_deref(), Some("set-express"));
        assert_eq!(result.output.get("matched_value"), Some(&json!("express")));
        assert_eq!(result.output.get("used_default"), Some(&json!(false)));

        let result = step
            .execute(&CancellationToken::new(), &mut ctx(json!({"order_type": "bulk"})))
            .await
            .unwrap();
        assert_eq!(result.next_step.as_deref(), Some("set-standard"));
        assert_eq!(result.output.get("used_default"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_conditional_no_match_no_default() {
        let step = ConditionalStep::new(
            "route",
            "status",
            HashMap::from([("active".to_string(), "handle-active".to_string())]),
            None,
        );
        let err = step
            .execute(&CancellationToken::new(), &mut ctx(json!({"status": "unknown"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found in routes"));
    }

    #[test]
    fn test_conditional_config_validation() {
        let err = ConditionalStep::from_config(
            "route",
            &config(json!({"field": "x", "routes": {}})),
            &Services::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one route"));
    }
}
