//! Template resolution for step configuration values.
//!
//! Steps that accept templated strings go through a [`TemplateResolver`]. The
//! kernel ships [`PathTemplateResolver`], which understands `{{ .path }}`
//! expressions only. Paths follow [`RunContext::lookup`]: working data at the
//! top level, plus `steps.<name>`, `trigger` and `meta`.

use crate::context::{DataMap, RunContext};
use crate::errors::StepflowError;
use regex::Regex;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::OnceLock;

/// Resolves templated strings against a run context.
pub trait TemplateResolver: Send + Sync + Debug {
    /// Resolves every expression in `template`.
    fn resolve(&self, template: &str, ctx: &RunContext) -> Result<String, StepflowError>;

    /// Resolves every string inside `value`, recursing into lists and maps.
    fn resolve_value(&self, value: &Value, ctx: &RunContext) -> Result<Value, StepflowError> {
        Ok(match value {
            Value::String(s) => Value::String(self.resolve(s, ctx)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_value(v, ctx))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve_value(v, ctx)?)))
                    .collect::<Result<_, StepflowError>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Resolves every value of a map.
    fn resolve_map(&self, map: &DataMap, ctx: &RunContext) -> Result<DataMap, StepflowError> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve_value(v, ctx)?)))
            .collect()
    }
}

#[allow(clippy::expect_used)]
fn action_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{(.*?)\}\}").expect("Invalid regex pattern"))
}

#[allow(clippy::expect_used)]
fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_-]*(?:\.[A-Za-z0-9_][A-Za-z0-9_-]*)*$")
            .expect("Invalid regex pattern")
    })
}

/// Substitutes `{{ .path }}` expressions with values from the context.
///
/// Strings render as-is, other values as JSON. A path that resolves to
/// nothing renders as the empty string. Any other expression is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathTemplateResolver;

impl PathTemplateResolver {
    /// Creates a new resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl TemplateResolver for PathTemplateResolver {
    fn resolve(&self, template: &str, ctx: &RunContext) -> Result<String, StepflowError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }

        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in action_pattern().captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&template[last..whole.start()]);

            let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
            let path = expr
                .strip_prefix('.')
                .filter(|p| path_pattern().is_match(p))
                .ok_or_else(|| {
                    StepflowError::execution(format!("unsupported template expression {expr:?}"))
                })?;
            if let Some(value) = ctx.lookup(path) {
                out.push_str(&render(&value));
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
