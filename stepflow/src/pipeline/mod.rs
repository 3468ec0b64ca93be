//! Pipeline building and execution.
//!
//! This module provides:
//! - the step sequence interpreter (merging, stop, jump targets)
//! - the pipeline orchestrator with stop / skip / compensate strategies
//! - a validating builder
//! - serde pipeline definitions assembled through a step registry

mod builder;
mod definition;
mod executor;
mod sequence;
mod strategy;

pub use builder::PipelineBuilder;
pub use definition::PipelineDefinition;
pub use executor::{Pipeline, COMPLETED_AT_KEY, PIPELINE_KEY, STARTED_AT_KEY};
pub use sequence::{
    ensure_unique_names, FailureHandling, PipelineResult, StepSequence, SKIP_ERROR_KEY,
    SKIP_MARKER_KEY,
};
pub use strategy::ErrorStrategy;
