//! Declarative step specifications.

use super::{RegistryProvider, Services, Step, StepConfig, StepRegistry};
use crate::errors::StepflowError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A step as written in a pipeline definition.
///
/// Every key besides `type` and `name` is the step's configuration:
///
/// ```json
/// { "type": "step.set", "name": "greet", "values": { "msg": "hi" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Registered step type.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Step name; composites derive one from their own name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Type-specific configuration.
    #[serde(flatten)]
    pub config: StepConfig,
}

impl StepSpec {
    /// Creates a spec for a step type with no name or configuration.
    #[must_use]
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            name: None,
            config: StepConfig::new(),
        }
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a configuration entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Builds the step through a registry, naming it `default_name` if the
    /// spec has no name.
    pub fn build(
        &self,
        default_name: &str,
        registry: &StepRegistry,
        services: &Services,
    ) -> Result<Arc<dyn Step>, StepflowError> {
        let name = self.name.as_deref().unwrap_or(default_name);
        registry.create(&self.step_type, name, &self.config, services)
    }
}

/// Builds a composite step's nested step.
///
/// The nested step is named `<parent>-<field>` unless its spec says otherwise.
pub(crate) fn build_nested(
    provider: &RegistryProvider,
    parent_type: &str,
    parent: &str,
    field: &str,
    spec: &StepSpec,
    services: &Services,
) -> Result<Arc<dyn Step>, StepflowError> {
    let registry = provider().ok_or_else(|| StepflowError::RegistryUnavailable {
        step_type: parent_type.to_string(),
        step: parent.to_string(),
    })?;
    spec.build(&format!("{parent}-{field}"), &registry, services)
}
