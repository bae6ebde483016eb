//! Helpers for reading JSON command arguments.
//!
//! Arguments arrive either as a JSON object or as a string holding one.
//! Lookups take a key path and report the full dotted path on failure.

use serde_json::{Map, Value};

use crate::error::{TmcError, TmcResult};

/// Parse a command argument into a JSON object.
///
/// # Errors
///
/// Returns `InvalidPayload` when the argument is missing, is not valid JSON
/// or is not an object.
pub fn parse_object(argin: Option<Value>) -> TmcResult<Value> {
    let value = match argin {
        None | Some(Value::Null) => {
            return Err(TmcError::invalid_payload("missing JSON argument"));
        }
        Some(Value::String(text)) => serde_json::from_str(&text)?,
        Some(value) => value,
    };
    if value.is_object() {
        Ok(value)
    } else {
        Err(TmcError::invalid_payload(format!(
            "expected a JSON object, got {value}"
        )))
    }
}

/// Walk `path` from `value`.
#[must_use]
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key))
}

fn missing(path: &[&str], expected: &str) -> TmcError {
    TmcError::invalid_payload(format!("{} must be {expected}", path.join(".")))
}

/// Required string at `path`.
///
/// # Errors
///
/// Returns `InvalidPayload` when the key is absent or not a string.
pub fn require_str<'a>(value: &'a Value, path: &[&str]) -> TmcResult<&'a str> {
    lookup(value, path)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(path, "a string"))
}

/// Required non-negative integer at `path`. Integral strings are accepted.
///
/// # Errors
///
/// Returns `InvalidPayload` when the key is absent or not an integer.
pub fn require_u64(value: &Value, path: &[&str]) -> TmcResult<u64> {
    lookup(value, path)
        .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
        .ok_or_else(|| missing(path, "a non-negative integer"))
}

/// Optional number at `path`.
///
/// # Errors
///
/// Returns `InvalidPayload` when the key is present but not a number.
pub fn optional_f64(value: &Value, path: &[&str]) -> TmcResult<Option<f64>> {
    match lookup(value, path) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| missing(path, "a number")),
    }
}

/// Required number at `path`.
///
/// # Errors
///
/// Returns `InvalidPayload` when the key is absent or not a number.
pub fn require_f64(value: &Value, path: &[&str]) -> TmcResult<f64> {
    optional_f64(value, path)?.ok_or_else(|| missing(path, "a number"))
}

/// Required array at `path`.
///
/// # Errors
///
/// Returns `InvalidPayload` when the key is absent or not an array.
pub fn require_array<'a>(value: &'a Value, path: &[&str]) -> TmcResult<&'a Vec<Value>> {
    lookup(value, path)
        .and_then(Value::as_array)
        .ok_or_else(|| missing(path, "an array"))
}

/// Required list of strings at `path`.
///
/// # Errors
///
/// Returns `InvalidPayload` when the key is absent or an entry is not a
/// string.
pub fn require_string_list(value: &Value, path: &[&str]) -> TmcResult<Vec<String>> {
    require_array(value, path)?
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| missing(path, "a list of strings"))
        })
        .collect()
}

/// Required list of unsigned integers at `path`.
///
/// # Errors
///
/// Returns `InvalidPayload` when the key is absent or an entry is not an
/// integer.
pub fn require_u64_list(value: &Value, path: &[&str]) -> TmcResult<Vec<u64>> {
    require_array(value, path)?
        .iter()
        .map(|item| {
            item.as_u64()
                .ok_or_else(|| missing(path, "a list of non-negative integers"))
        })
        .collect()
}

/// Mutable object at `path`, creating intermediate objects as needed.
///
/// # Errors
///
/// Returns `InvalidPayload` when a segment exists but is not an object.
pub fn object_mut<'a>(value: &'a mut Value, path: &[&str]) -> TmcResult<&'a mut Map<String, Value>> {
    let mut current = value;
    for (depth, key) in path.iter().enumerate() {
        let object = current
            .as_object_mut()
            .ok_or_else(|| missing(&path[..depth], "an object"))?;
        current = object
            .entry((*key).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current
        .as_object_mut()
        .ok_or_else(|| missing(path, "an object"))
}

/// Merge object `incoming` into object `held`. Arrays under `lists` gain the
/// items they lack; every other key is replaced.
pub fn merge_lists(held: &mut Value, incoming: &Value, lists: &[&str]) {
    let (Some(held), Some(incoming)) = (held.as_object_mut(), incoming.as_object()) else {
        return;
    };
    for (key, value) in incoming {
        match (held.get_mut(key), value) {
            (Some(Value::Array(existing)), Value::Array(added)) if lists.contains(&key.as_str()) => {
                for item in added {
                    if !existing.contains(item) {
                        existing.push(item.clone());
                    }
                }
            }
            _ => {
                held.insert(key.clone(), value.clone());
            }
        }
    }
}
