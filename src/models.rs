//! Core data types shared across the engine.

use serde_json::Value;
use std::collections::BTreeMap;

/// Parameter name → value used for template expansion and testing.
pub type ParameterSet = BTreeMap<String, String>;

/// HTTP header name → value.
pub type HeaderSet = BTreeMap<String, String>;

/// Convert a JSON object into a [`ParameterSet`].
///
/// Strings are kept verbatim, `null` entries are dropped, and every other
/// value is stored as its compact JSON text (`42`, `true`, `[1,2]`).
/// Returns `None` when `value` is not an object.
pub fn parameter_set_from_json(value: &Value) -> Option<ParameterSet> {
    let object = value.as_object()?;
    let mut set = ParameterSet::new();
    for (name, value) in object {
        match value {
            Value::Null => {}
            Value::String(s) => {
                set.insert(name.clone(), s.clone());
            }
            other => {
                set.insert(name.clone(), other.to_string());
            }
        }
    }
    Some(set)
}

/// Render a [`ParameterSet`] as a JSON object of strings.
pub fn parameter_set_to_json(set: &ParameterSet) -> Value {
    Value::Object(
        set.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Shallow-merge `partial` over `base`: every top-level field of `partial`
/// replaces the same field of `base`; fields only in `base` survive.
///
/// A non-object `base` is treated as an empty object.
pub fn shallow_merge(base: &Value, partial: &serde_json::Map<String, Value>) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_default();
    for (key, value) in partial {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}
