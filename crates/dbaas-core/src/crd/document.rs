//! Engine-tagged custom resource document with overlay support

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{CoreError, Result};
use crate::params::Engine;

/// Metadata fields the platform owns; they are dropped before re-applying a stored document
const SERVER_OWNED_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

/// A complete custom resource ready to be applied
#[derive(Debug, Clone, PartialEq)]
pub struct CrDocument {
    engine: Engine,
    value: JsonValue,
}

impl CrDocument {
    pub(crate) fn new(engine: Engine, value: JsonValue) -> Self {
        Self { engine, value }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn api_version(&self) -> Option<&str> {
        self.value.get("apiVersion").and_then(JsonValue::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.value.get("kind").and_then(JsonValue::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.value
            .pointer("/metadata/name")
            .and_then(JsonValue::as_str)
    }

    /// Get a value by JSON pointer (e.g. `/spec/pxc/size`)
    pub fn get(&self, pointer: &str) -> Option<&JsonValue> {
        self.value.pointer(pointer)
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.value
    }

    pub fn into_value(self) -> JsonValue {
        self.value
    }

    /// Compact JSON encoding; identical inputs always produce identical bytes
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.value)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.value)?)
    }
}

/// Serialize a typed fragment, dropping every absent field
pub(crate) fn to_value<T: Serialize>(fragment: &T) -> Result<JsonValue> {
    serde_json::to_value(fragment).map_err(CoreError::from)
}

/// Prepare a stored document for re-application
///
/// Drops the observed status and platform-owned metadata; every other field
/// is kept verbatim.
pub(crate) fn strip_server_fields(document: &mut JsonValue) {
    if let JsonValue::Object(map) = document {
        map.remove("status");
        if let Some(JsonValue::Object(metadata)) = map.get_mut("metadata") {
            for field in SERVER_OWNED_METADATA {
                metadata.remove(*field);
            }
        }
    }
}

/// Overlay `overlay` onto `base`
///
/// Rules:
/// - Objects: recursive merge, keys missing from the overlay are preserved
/// - Arrays whose elements are all objects with a `name`: merged element-wise by name,
///   unmatched overlay elements are appended
/// - Everything else: overlay replaces base
pub(crate) fn overlay(base: &mut JsonValue, overlay_value: &JsonValue) {
    match (base, overlay_value) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (JsonValue::Array(base_items), JsonValue::Array(overlay_items))
            if all_named(base_items) && all_named(overlay_items) =>
        {
            for item in overlay_items {
                let name = item.get("name");
                match base_items.iter_mut().find(|b| b.get("name") == name) {
                    Some(existing) => overlay(existing, item),
                    None => base_items.push(item.clone()),
                }
            }
        }
        (base, overlay_value) => {
            *base = overlay_value.clone();
        }
    }
}

fn all_named(items: &[JsonValue]) -> bool {
    items
        .iter()
        .all(|item| item.get("name").is_some_and(JsonValue::is_string))
}

/// Get a mutable object at a slash-separated path, if every segment exists
pub(crate) fn object_at<'a>(
    value: &'a mut JsonValue,
    path: &[&str],
) -> Option<&'a mut serde_json::Map<String, JsonValue>> {
    let mut current = value;
    for segment in path {
        current = current.get_mut(*segment)?;
    }
    current.as_object_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_overlay_preserves_unmentioned_fields() {
        let mut base = json!({"spec": {"a": 1, "nested": {"x": true}}});
        overlay(&mut base, &json!({"spec": {"b": 2, "nested": {"y": false}}}));
        assert_eq!(
            base,
            json!({"spec": {"a": 1, "b": 2, "nested": {"x": true, "y": false}}})
        );
    }

    #[test]
    fn test_overlay_replaces_scalars_and_plain_arrays() {
        let mut base = json!({"size": 3, "modes": ["ReadWriteOnce"]});
        overlay(&mut base, &json!({"size": 5, "modes": ["ReadWriteMany"]}));
        assert_eq!(base, json!({"size": 5, "modes": ["ReadWriteMany"]}));
    }

    #[test]
    fn test_overlay_merges_named_arrays() {
        let mut base = json!([
            {"name": "rs0", "size": 3, "configuration": "operationProfiling: {}"},
            {"name": "rs1", "size": 3}
        ]);
        overlay(&mut base, &json!([{"name": "rs0", "size": 5}, {"name": "rs2", "size": 1}]));
        assert_eq!(
            base,
            json!([
                {"name": "rs0", "size": 5, "configuration": "operationProfiling: {}"},
                {"name": "rs1", "size": 3},
                {"name": "rs2", "size": 1}
            ])
        );
    }

    #[test]
    fn test_strip_server_fields() {
        let mut doc = json!({
            "apiVersion": "pxc.percona.com/v1",
            "metadata": {"name": "orders", "uid": "abc", "resourceVersion": "17", "labels": {"a": "b"}},
            "spec": {"pause": false},
            "status": {"state": "ready"}
        });
        strip_server_fields(&mut doc);
        assert_eq!(
            doc,
            json!({
                "apiVersion": "pxc.percona.com/v1",
                "metadata": {"name": "orders", "labels": {"a": "b"}},
                "spec": {"pause": false}
            })
        );
    }

    #[test]
    fn test_object_at() {
        let mut doc = json!({"spec": {"pxc": {"size": 3}}});
        assert!(object_at(&mut doc, &["spec", "pxc"]).is_some());
        assert!(object_at(&mut doc, &["spec", "haproxy"]).is_none());
        assert!(object_at(&mut doc, &["spec", "pxc", "size"]).is_none());
    }
}
