//! Run event recording.
//!
//! The orchestrator reports lifecycle events to an [`EventSink`]. Recording is
//! best effort: a sink can never fail a run.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run started.
pub const EXECUTION_STARTED: &str = "execution.started";
/// Every step completed.
pub const EXECUTION_COMPLETED: &str = "execution.completed";
/// A step asked the run to stop early.
pub const EXECUTION_STOPPED: &str = "execution.stopped";
/// The run ended with an error.
pub const EXECUTION_FAILED: &str = "execution.failed";
/// A step is about to run.
pub const STEP_STARTED: &str = "step.started";
/// A step succeeded and its output was merged.
pub const STEP_COMPLETED: &str = "step.completed";
/// A step failed and the run is aborting, or a compensation step failed.
pub const STEP_FAILED: &str = "step.failed";
/// A step failed and was skipped.
pub const STEP_SKIPPED: &str = "step.skipped";
/// Compensation is starting.
pub const SAGA_COMPENSATING: &str = "saga.compensating";
/// A compensation step succeeded.
pub const STEP_COMPENSATED: &str = "step.compensated";
/// Every compensation step succeeded.
pub const SAGA_COMPENSATED: &str = "saga.compensated";
