//! Dotted path traversal over JSON values.

use serde_json::Value;

/// Walks `path` (`a.b.0.c`) from `root`.
///
/// Object segments are keys; array segments are zero-based indices. An empty
/// path returns `root` itself.
#[must_use]
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
