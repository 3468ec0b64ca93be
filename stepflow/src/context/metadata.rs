//! Side-channel metadata carried alongside a run.

use super::DataMap;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Metadata key set once a step has written the response for this run.
pub const RESPONSE_SENT_KEY: &str = "_response_sent";

/// Cross-cutting values for a run that are not part of the working data.
///
/// Plain values are JSON. Anything else (a response writer, a client handle)
/// is stored as a typed handle and retrieved by downcasting.
#[derive(Clone, Default)]
pub struct RunMetadata {
    values: DataMap,
    handles: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl RunMetadata {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates metadata seeded with values.
    #[must_use]
    pub fn from_values(values: DataMap) -> Self {
        Self {
            values,
            handles: HashMap::new(),
        }
    }

    /// Gets a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Sets a value, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Returns true if a value is set for the key.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Copies every entry of `values` in, overwriting existing keys.
    pub fn extend(&mut self, values: &DataMap) {
        self.values
            .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Returns all plain values.
    #[must_use]
    pub fn values(&self) -> &DataMap {
        &self.values
    }

    /// Stores a typed handle.
    pub fn insert_handle<T: Any + Send + Sync>(&mut self, key: impl Into<String>, handle: Arc<T>) {
        self.handles.insert(key.into(), handle);
    }

    /// Retrieves a typed handle, or `None` if absent or of another type.
    #[must_use]
    pub fn handle<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.handles
            .get(key)
            .cloned()
            .and_then(|h| h.downcast::<T>().ok())
    }

    /// Records that the run's response has already been written.
    pub fn mark_response_sent(&mut self) {
        self.insert(RESPONSE_SENT_KEY, true);
    }

    /// Returns true once a step has written the response.
    #[must_use]
    pub fn response_sent(&self) -> bool {
        self.get(RESPONSE_SENT_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for RunMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handles: Vec<&String> = self.handles.keys().collect();
        handles.sort();
        f.debug_struct("RunMetadata")
            .field("values", &self.values)
            .field("handles", &handles)
            .finish()
    }
}
