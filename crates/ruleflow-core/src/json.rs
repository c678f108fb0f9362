//! JSON document helpers
//!
//! Deep merge (PUT semantics), JSON-pointer insertion and link handling.

use serde_json::{Map, Value};

use crate::ids::{ResourceId, Revision};

/// Merge `patch` into `target`
///
/// Objects are merged key by key, recursively. Any other value in `patch`
/// replaces the value in `target`.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_val) in patch_map {
                let nested = patch_val.is_object()
                    && target_map.get(&key).is_some_and(Value::is_object);
                match target_map.get_mut(&key) {
                    Some(existing) if nested => deep_merge(existing, patch_val),
                    _ => {
                        target_map.insert(key, patch_val);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Insert `value` at JSON `pointer`, creating intermediate objects
///
/// Unlike [`Value::pointer_mut`], missing levels are created. A non-object
/// value sitting on the way is replaced by an object.
///
/// # Errors
/// Returns error if `pointer` is non-empty and does not start with `/`
pub fn set_pointer(target: &mut Value, pointer: &str, value: Value) -> Result<(), PointerError> {
    if pointer.is_empty() {
        *target = value;
        return Ok(());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(PointerError::MissingLeadingSlash(pointer.to_string()));
    };

    let tokens: Vec<String> = rest.split('/').map(unescape_token).collect();
    let (last, parents) = tokens
        .split_last()
        .ok_or_else(|| PointerError::MissingLeadingSlash(pointer.to_string()))?;

    let mut cursor = target;
    for token in parents {
        cursor = ensure_object(cursor)
            .entry(token.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(cursor).insert(last.clone(), value);
    Ok(())
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Build a link to a resource
///
/// A versioned link carries the revision it was made against.
#[must_use]
pub fn link(id: &ResourceId, revision: Option<Revision>) -> Value {
    let mut map = Map::new();
    map.insert("_id".into(), Value::String(id.as_str().to_string()));
    if let Some(rev) = revision {
        map.insert("_rev".into(), Value::from(rev.0));
    }
    Value::Object(map)
}

/// Whether `value` is a link (an object holding only `_id` and optionally `_rev`)
#[must_use]
pub fn is_link(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    map.get("_id").is_some_and(Value::is_string)
        && map.keys().all(|k| k == "_id" || k == "_rev")
}

/// `_id` of a document or link
#[must_use]
pub fn resource_id(value: &Value) -> Option<ResourceId> {
    value.get("_id").and_then(Value::as_str).map(ResourceId::new)
}

/// `_rev` of a document or link
#[must_use]
pub fn revision(value: &Value) -> Option<Revision> {
    value.get("_rev").and_then(Value::as_u64).map(Revision)
}

/// Whether a key is reserved for store bookkeeping (`_id`, `_rev`, `_meta`, `_type`)
#[inline]
#[must_use]
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with('_')
}

/// JSON pointer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointerError {
    /// Pointer does not start with `/`
    #[error("json pointer '{0}' must start with '/'")]
    MissingLeadingSlash(String),
}
