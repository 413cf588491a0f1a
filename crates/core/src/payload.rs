//! Field accessors over raw resource snapshots.
//!
//! Event handlers never chain optional lookups ad hoc; they go through these
//! helpers so a missing field is reported as [`PayloadError::Missing`].

use serde_json::{Map, Value};

use crate::{PayloadError, Resource};

pub const CLASS_FIELD: &str = "spec.clusterServiceClassExternalName";
pub const DASHBOARD_URL_ANNOTATION: &str = "integreatly/dashboard-url";

/// String at a JSON pointer, reported as `field` when absent.
pub fn str_at<'a>(res: &'a Resource, pointer: &str, field: &'static str) -> Result<&'a str, PayloadError> {
    match res.pointer(pointer) {
        None | Some(Value::Null) => Err(PayloadError::Missing(field)),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(PayloadError::Invalid { field, reason: format!("expected string, got {}", other) }),
    }
}

pub fn name(res: &Resource) -> Option<&str> {
    res.pointer("/metadata/name").and_then(Value::as_str)
}

pub fn namespace(res: &Resource) -> Result<&str, PayloadError> {
    str_at(res, "/metadata/namespace", "metadata.namespace")
}

pub fn resource_version(res: &Resource) -> Option<&str> {
    res.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

/// Service class external name, the key of service instances.
pub fn class_name(res: &Resource) -> Result<&str, PayloadError> {
    str_at(res, "/spec/clusterServiceClassExternalName", CLASS_FIELD)
}

pub fn annotation<'a>(res: &'a Resource, key: &str) -> Option<&'a str> {
    res.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(key))
        .and_then(Value::as_str)
}

/// URL a consumer should open for a service instance: the broker-reported
/// `status.dashboardURL`, else the dashboard annotation.
pub fn dashboard_url(instance: &Resource) -> Option<&str> {
    instance
        .pointer("/status/dashboardURL")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| annotation(instance, DASHBOARD_URL_ANNOTATION))
}

fn metadata_mut(res: &mut Resource) -> Result<&mut Map<String, Value>, PayloadError> {
    let root = res
        .as_object_mut()
        .ok_or(PayloadError::Invalid { field: "metadata", reason: "resource is not an object".into() })?;
    root.entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or(PayloadError::Invalid { field: "metadata", reason: "expected object".into() })
}

pub fn set_annotation(res: &mut Resource, key: &str, value: &str) -> Result<(), PayloadError> {
    let meta = metadata_mut(res)?;
    let annotations = meta
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    if annotations.is_null() {
        *annotations = Value::Object(Map::new());
    }
    let annotations = annotations
        .as_object_mut()
        .ok_or(PayloadError::Invalid { field: "metadata.annotations", reason: "expected object".into() })?;
    annotations.insert(key.to_string(), Value::String(value.to_string()));
    Ok(())
}

pub fn set_metadata_str(res: &mut Resource, key: &str, value: &str) -> Result<(), PayloadError> {
    metadata_mut(res)?.insert(key.to_string(), Value::String(value.to_string()));
    Ok(())
}
