//! The value a step hands back to the orchestrator.

use crate::context::DataMap;

/// Result of a successful step execution.
///
/// The orchestrator merges `output` into the working data and records it
/// under the step's name. `stop` halts the run successfully once the output
/// is merged; `next_step` moves execution to the named step instead of the
/// next one in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    /// Fields produced by the step.
    pub output: DataMap,
    /// End the run successfully after this step.
    pub stop: bool,
    /// Name of the step to run next.
    pub next_step: Option<String>,
}

impl StepResult {
    /// Creates a result with the given output.
    #[must_use]
    pub fn ok(output: DataMap) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    /// Creates a result with no output.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a result with a single output field.
    #[must_use]
    pub fn ok_value(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::empty().with_value(key, value)
    }

    /// Adds an output field.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.output.insert(key.into(), value.into());
        self
    }

    /// Marks the run to stop after this step.
    #[must_use]
    pub const fn with_stop(mut self) -> Self {
        self.stop = true;
        self
    }

    /// Sets the jump target.
    #[must_use]
    pub fn with_next_step(mut self, step: impl Into<String>) -> Self {
        self.next_step = Some(step.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_result_continues() {
        let r = StepResult::empty();
        assert!(r.output.is_empty());
        assert!(!r.stop);
        assert!(r.next_step.is_none());
    }

    #[test]
    fn test_builders() {
        let r = StepResult::ok_value("a", 1)
            .with_value("b", "two")
            .with_next_step("finish")
            .with_stop();
        assert_eq!(r.output.get("a"), Some(&json!(1)));
        assert_eq!(r.output.get("b"), Some(&json!("two")));
        assert_eq!(r.next_step.as_deref(), Some("finish"));
        assert!(r.stop);
    }
}
