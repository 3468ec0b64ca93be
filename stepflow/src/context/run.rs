//! The mutable state of one pipeline run.

use super::{resolve_path, DataMap, RunMetadata};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Path prefixes that address step outputs instead of working data.
const STEP_OUTPUT_PREFIXES: [&str; 2] = ["steps", "stepOutputs"];

/// State threaded through every step of a single run.
///
/// - `trigger` is the data the run started with and never changes.
/// - `current` starts as a copy of `trigger` and absorbs each successful
///   step's output (shallow merge, last write wins).
/// - step outputs keep each step's own unmerged output by step name.
///
/// Steps receive `&mut RunContext`, so only one step at a time can touch it.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Uuid,
    trigger: Arc<DataMap>,
    current: DataMap,
    step_outputs: HashMap<String, DataMap>,
    metadata: RunMetadata,
}

impl RunContext {
    /// Creates a context for a new run.
    #[must_use]
    pub fn new(trigger: DataMap) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            current: trigger.clone(),
            trigger: Arc::new(trigger),
            step_outputs: HashMap::new(),
            metadata: RunMetadata::new(),
        }
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns the run identifier.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the data the run was triggered with.
    #[must_use]
    pub fn trigger(&self) -> &DataMap {
        &self.trigger
    }

    /// Returns the working data.
    #[must_use]
    pub const fn current(&self) -> &DataMap {
        &self.current
    }

    /// Returns the working data mutably.
    pub fn current_mut(&mut self) -> &mut DataMap {
        &mut self.current
    }

    /// Gets a working data field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.current.get(key)
    }

    /// Sets a working data field.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.current.insert(key.into(), value.into());
    }

    /// Returns the recorded output of a step.
    #[must_use]
    pub fn step_output(&self, step: &str) -> Option<&DataMap> {
        self.step_outputs.get(step)
    }

    /// Returns every recorded step output.
    #[must_use]
    pub const fn step_outputs(&self) -> &HashMap<String, DataMap> {
        &self.step_outputs
    }

    /// Records a step's output without touching the working data.
    ///
    /// A second recording for the same step replaces the first.
    pub fn record_step_output(&mut self, step: impl Into<String>, output: DataMap) {
        self.step_outputs.insert(step.into(), output);
    }

    /// Merges a step's output into the working data and records it.
    pub fn merge_step_output(&mut self, step: impl Into<String>, output: DataMap) {
        self.current
            .extend(output.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.step_outputs.insert(step.into(), output);
    }

    /// Returns the metadata.
    #[must_use]
    pub const fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Returns the metadata mutably.
    pub fn metadata_mut(&mut self) -> &mut RunMetadata {
        &mut self.metadata
    }

    /// Resolves a dotted path against the context.
    ///
    /// - `steps.<name>.…` and `stepOutputs.<name>.…` read step outputs
    /// - `trigger.…` reads the trigger snapshot
    /// - `meta.…` reads metadata values
    /// - anything else reads the working data
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let (head, rest) = split_head(path);
        if STEP_OUTPUT_PREFIXES.contains(&head) {
            let (step, rest) = split_head(rest?);
            return lookup_in(self.step_outputs.get(step)?, rest);
        }
        match head {
            "trigger" => lookup_in(&self.trigger, rest),
            "meta" => lookup_in(self.metadata.values(), rest),
            _ => lookup_in(&self.current, Some(path)),
        }
    }

    /// Creates a sub-context for one for-each iteration.
    ///
    /// The fork shares the trigger and run id, copies the working data and
    /// metadata, and starts with no step outputs.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            run_id: self.run_id,
            trigger: Arc::clone(&self.trigger),
            current: self.current.clone(),
            step_outputs: HashMap::new(),
            metadata: self.metadata.clone(),
        }
    }

    /// Consumes the context, returning the working data.
    #[must_use]
    pub fn into_current(self) -> DataMap {
        self.current
    }
}

fn split_head(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

fn lookup_in(map: &DataMap, path: Option<&str>) -> Option<Value> {
    let Some(path) = path else {
        return Some(Value::Object(
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ));
    };
    let (key, rest) = split_head(path);
    let value = map.get(key)?;
    resolve_path(value, rest.unwrap_or("")).cloned()
}
