//! Helpers over opaque JSON payloads.

use serde_json::Value;
use std::collections::BTreeSet;

/// Shallow field merge used when local writes coalesce.
///
/// When both values are objects, keys from `overlay` replace keys in `base`
/// and the remaining keys of `base` are kept. Otherwise `overlay` wins whole.
pub fn merge_fields(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

/// Returns the top-level keys whose values differ between two payloads.
///
/// Keys present on only one side count as changed. Non-object payloads have
/// no field structure, so they yield an empty list.
pub fn changed_fields(left: &Value, right: &Value) -> Vec<String> {
    let (Value::Object(left), Value::Object(right)) = (left, right) else {
        return Vec::new();
    };

    let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
    keys.into_iter()
        .filter(|key| left.get(*key) != right.get(*key))
        .cloned()
        .collect()
}
