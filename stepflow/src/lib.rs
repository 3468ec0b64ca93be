//! # Stepflow
//!
//! A workflow pipeline orchestration kernel.
//!
//! A pipeline is a named sequence of typed steps run against a per-run
//! context. Stepflow provides:
//!
//! - **Run context**: trigger snapshot, merged working data, per-step outputs
//!   and side-channel metadata
//! - **Step registry**: string-typed factories so pipelines can be assembled
//!   from JSON definitions
//! - **Orchestration**: jump targets, stop signalling and the stop / skip /
//!   compensate error strategies
//! - **Resilience composites**: retry with exponential backoff, circuit
//!   breaker with fallback, and for-each iteration
//! - **Cancellation**: cooperative tokens with deadlines
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepflow::prelude::*;
//!
//! let registry = StepRegistry::with_builtins();
//! let pipeline = PipelineDefinition::from_file("orders.json")?
//!     .build(&registry, &Services::new())?;
//!
//! let current = pipeline.run(&CancellationToken::new(), trigger).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod context;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod steps;
pub mod template;
pub mod testing;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::context::{DataMap, RunContext, RunMetadata};
    pub use crate::errors::StepflowError;
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat, TracingConfig};
    pub use crate::pipeline::{
        ErrorStrategy, Pipeline, PipelineBuilder, PipelineDefinition, PipelineResult,
    };
    pub use crate::steps::{
        CircuitBreakerStep, ForEachStep, RetryWithBackoffStep, Services, Step, StepRegistry,
        StepResult, StepSpec,
    };
    pub use crate::template::{PathTemplateResolver, TemplateResolver};
}
