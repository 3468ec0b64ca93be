//! Observability utilities.
//!
//! This module provides:
//! - subscriber initialisation for binaries and tests embedding the kernel
//! - SpanTimer for step and run durations

mod subscriber;
mod timer;

pub use subscriber::{init_tracing, LogFormat, TracingConfig};
pub use timer::SpanTimer;
