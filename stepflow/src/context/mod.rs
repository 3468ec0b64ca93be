//! Per-run context threaded through every step.
//!
//! This module provides:
//! - RunContext holding the trigger snapshot, working data and step outputs
//! - RunMetadata for side-channel values and opaque handles
//! - Dotted path lookup across the context

#[cfg(test)]
mod context_tests;
mod metadata;
mod path;
mod run;

pub use metadata::{RunMetadata, RESPONSE_SENT_KEY};
pub use path::resolve_path;
pub use run::RunContext;

/// Field name to value map used for trigger data, working data and step outputs.
pub type DataMap = std::collections::HashMap<String, serde_json::Value>;
