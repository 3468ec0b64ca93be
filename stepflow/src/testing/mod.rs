//! Testing utilities for stepflow pipelines.
//!
//! This module provides:
//! - Mock steps with call tracking
//! - Context and configuration fixtures

mod fixtures;
mod mocks;

pub use fixtures::{data_map, step_config, TestContext};
pub use mocks::{FailingStep, FlakyStep, MockStep, RecordingStep, SlowStep};
