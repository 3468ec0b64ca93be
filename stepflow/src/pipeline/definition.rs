//! Serializable pipeline definitions.

use super::{ErrorStrategy, Pipeline, PipelineBuilder};
use crate::context::DataMap;
use crate::errors::StepflowError;
use crate::steps::{ConfigDuration, Services, StepRegistry, StepSpec};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A pipeline as written in configuration.
///
/// ```json
/// {
///   "name": "orders",
///   "on_error": "compensate",
///   "timeout": "30s",
///   "steps": [{ "type": "step.set", "name": "init", "values": { "status": "new" } }],
///   "compensation": [{ "type": "step.log", "message": "rolling back" }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub name: String,
    /// Steps in execution order.
    pub steps: Vec<StepSpec>,
    /// Error strategy.
    #[serde(default)]
    pub on_error: ErrorStrategy,
    /// Steps run when a step fails under the compensate strategy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation: Vec<StepSpec>,
    /// Run timeout, as milliseconds or a duration string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<ConfigDuration>,
    /// Metadata copied into every run.
    #[serde(default, skip_serializing_if = "DataMap::is_empty")]
    pub metadata: DataMap,
}

impl PipelineDefinition {
    /// Parses a definition from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`StepflowError::Serialization`] for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, StepflowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a definition from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`StepflowError::Io`] if the file cannot be read and
    /// [`StepflowError::Serialization`] for malformed JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StepflowError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Serializes the definition as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`StepflowError::Serialization`] if a value cannot be encoded.
    pub fn to_json(&self) -> Result<String, StepflowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Builds the pipeline through `registry`.
    ///
    /// # Errors
    ///
    /// Returns factory errors and builder validation errors.
    pub fn build(
        &self,
        registry: &StepRegistry,
        services: &Services,
    ) -> Result<Pipeline, StepflowError> {
        PipelineBuilder::from_definition(self, registry, services)?.build()
    }
}
