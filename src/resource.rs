//! Helpers for working with schema-less Kubernetes resource documents.
//!
//! The engine never deserializes resources into typed structs: every
//! resource is a [`serde_json::Value`] shaped like the object the API
//! server would store. These helpers read the handful of well-known
//! fields the engine cares about.

use serde_json::Value;

/// Kinds whose pods are validated at the controller level instead of
/// individually.
const WORKLOAD_CONTROLLER_KINDS: &[&str] = &[
    "DaemonSet",
    "ReplicaSet",
    "ReplicationController",
    "StatefulSet",
    "Job",
    "CronJob",
];

/// Returns the `kind` of the resource, or the empty string when unset.
pub fn kind(resource: &Value) -> &str {
    resource.get("kind").and_then(Value::as_str).unwrap_or("")
}

/// Returns the `apiVersion` of the resource, or the empty string when unset.
pub fn api_version(resource: &Value) -> &str {
    resource
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Returns `metadata.name`, or the empty string when unset.
pub fn name(resource: &Value) -> &str {
    resource
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Returns `metadata.namespace`, or the empty string for cluster-scoped
/// resources.
pub fn namespace(resource: &Value) -> &str {
    resource
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Returns `metadata.labels` as a JSON object, or `None` when the resource
/// carries no labels.
pub fn labels(resource: &Value) -> Option<&serde_json::Map<String, Value>> {
    resource.pointer("/metadata/labels").and_then(Value::as_object)
}

/// True when the document does not describe a resource at all: admission
/// events carry an empty old resource on CREATE and an empty new resource
/// on DELETE.
pub fn is_empty(resource: &Value) -> bool {
    match resource {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// True when the resource is a Pod owned by a workload controller
/// (DaemonSet, ReplicaSet, Job, ...). Such pods are skipped by the policy
/// driver: the controller-level resource is validated instead.
pub fn owned_by_workload_controller(resource: &Value) -> bool {
    if kind(resource) != "Pod" {
        return false;
    }
    resource
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|owners| {
            owners.iter().any(|owner| {
                owner
                    .get("kind")
                    .and_then(Value::as_str)
                    .map(|k| WORKLOAD_CONTROLLER_KINDS.contains(&k))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}
