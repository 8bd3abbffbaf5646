//! Nested string-keyed documents with dotted-path access.
//!
//! Annotation maps, hint trees, and metadata documents all share this
//! shape: a JSON-like object whose keys may be addressed as dotted paths
//! (`"orchestrator.cluster.name"`). Keys are kept sorted, so iteration
//! order is deterministic.

use serde_json::Value;

/// A nested string-keyed document.
pub type Mapping = serde_json::Map<String, Value>;

/// Insert `value` at a dotted `path`, creating intermediate objects as
/// needed. A non-object intermediate is replaced by an object.
pub fn put(map: &mut Mapping, path: &str, value: Value) {
    let mut current = map;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Mapping::new()));
        if !entry.is_object() {
            *entry = Value::Object(Mapping::new());
        }
        current = entry.as_object_mut().unwrap();
    }
}

/// Look up a dotted `path`. Returns `None` when any segment is missing or
/// an intermediate is not an object.
pub fn get<'a>(map: &'a Mapping, path: &str) -> Option<&'a Value> {
    let mut current = map;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = current.get(segment)?;
        if segments.peek().is_none() {
            return Some(value);
        }
        current = value.as_object()?;
    }
    None
}

/// Recursively merge `src` into `dst`. Nested objects are merged
/// key-by-key; anything else in `src` replaces the destination value.
pub fn deep_merge(dst: &mut Mapping, src: &Mapping) {
    for (key, value) in src {
        match (dst.get_mut(key), value) {
            (Some(Value::Object(dst_child)), Value::Object(src_child)) => {
                deep_merge(dst_child, src_child);
            }
            _ => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Build a nested mapping from flat `(key, value)` pairs by dotted-path
/// insertion. Only `.` separates segments; `/` stays inside a segment, so
/// the annotation `co.elastic.logs/multiline.pattern` nests as
/// `co -> elastic -> logs/multiline -> pattern`.
pub fn from_pairs<I, K, V>(pairs: I) -> Mapping
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut map = Mapping::new();
    for (key, value) in pairs {
        put(&mut map, key.as_ref(), Value::String(value.into()));
    }
    map
}

/// Replace every `.` in `key` with `_`.
pub fn dedot(key: &str) -> String {
    key.replace('.', "_")
}
