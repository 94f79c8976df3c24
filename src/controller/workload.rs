//! Semi-structured workload access
//!
//! Workloads are handled as `DynamicObject`s so any orchestrator kind that
//! follows the `spec.replicas` / `status.*Replicas` convention can take part in
//! a rollout. `WorkloadView` extracts the fixed set of fields the readiness
//! evaluator and controllers need, each presence-checked.

use crate::crd::canary::{Canary, CrossNamespaceObjectReference};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::core::{DynamicObject, GroupVersionKind};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Node selector key used to park DaemonSet pods on no node at all
pub const SCALE_TO_ZERO_NODE_SELECTOR: &str = "kulta.io/scale-to-zero";

/// Identity of a workload: (kind, api-version, name, namespace)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl WorkloadRef {
    pub fn new(api_version: &str, kind: &str, name: &str, namespace: &str) -> Self {
        WorkloadRef {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Build from a CRD reference, defaulting the namespace
    pub fn from_reference(reference: &CrossNamespaceObjectReference, default_namespace: &str) -> Self {
        WorkloadRef {
            api_version: reference.api_version.clone(),
            kind: reference.kind.clone(),
            name: reference.name.clone(),
            namespace: reference
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
        }
    }

    /// The canary's target workload, None when no namespace can be derived
    pub fn target_of(canary: &Canary) -> Option<Self> {
        let namespace = canary.target_namespace()?;
        Some(Self::from_reference(&canary.spec.target_ref, &namespace))
    }

    /// Identity of a fetched object
    pub fn of(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        Some(WorkloadRef {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            name: obj.metadata.name.clone()?,
            namespace: obj.metadata.namespace.clone()?,
        })
    }

    /// Same kind and namespace, different name
    pub fn with_name(&self, name: &str) -> Self {
        WorkloadRef {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        };
        GroupVersionKind::gvk(group, version, &self.kind)
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.kind, self.name, self.namespace)
    }
}

/// Where a workload shape keeps its replica counters
struct ReplicaFields {
    desired: &'static [&'static str],
    total: &'static [&'static str],
    updated: &'static [&'static str],
    available: &'static [&'static str],
}

const STANDARD_FIELDS: ReplicaFields = ReplicaFields {
    desired: &["spec", "replicas"],
    total: &["status", "replicas"],
    updated: &["status", "updatedReplicas"],
    available: &["status", "availableReplicas"],
};

const DAEMONSET_FIELDS: ReplicaFields = ReplicaFields {
    desired: &["status", "desiredNumberScheduled"],
    total: &["status", "currentNumberScheduled"],
    updated: &["status", "updatedNumberScheduled"],
    available: &["status", "numberAvailable"],
};

/// A status condition as published by Deployment-like kinds
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkloadCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "lastTransitionTime", default)]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(rename = "lastUpdateTime", default)]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl WorkloadCondition {
    /// When the condition last changed; older objects only carry lastUpdateTime
    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.last_transition_time.or(self.last_update_time)
    }
}

/// Read-only adapter over a fetched workload
pub struct WorkloadView<'a> {
    obj: &'a DynamicObject,
}

impl<'a> WorkloadView<'a> {
    pub fn new(obj: &'a DynamicObject) -> Self {
        WorkloadView { obj }
    }

    pub fn kind(&self) -> &str {
        self.obj
            .types
            .as_ref()
            .map(|t| t.kind.as_str())
            .unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.obj.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.obj.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn generation(&self) -> i64 {
        self.obj.metadata.generation.unwrap_or(0)
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.nested_i64(&["status", "observedGeneration"])
    }

    /// Kinds whose counters are typed fields that the orchestrator omits when zero
    pub fn has_typed_status(&self) -> bool {
        matches!(self.kind(), "Deployment" | "DaemonSet" | "StatefulSet")
    }

    /// Kinds that publish Progressing/Available conditions
    pub fn has_rich_conditions(&self) -> bool {
        self.kind() == "Deployment"
    }

    fn fields(&self) -> &'static ReplicaFields {
        if self.kind() == "DaemonSet" {
            &DAEMONSET_FIELDS
        } else {
            &STANDARD_FIELDS
        }
    }

    pub fn desired_replicas(&self) -> Option<i64> {
        self.nested_i64(self.fields().desired)
    }

    pub fn status_replicas(&self) -> Option<i64> {
        self.nested_i64(self.fields().total)
    }

    pub fn updated_replicas(&self) -> Option<i64> {
        self.nested_i64(self.fields().updated)
    }

    pub fn available_replicas(&self) -> Option<i64> {
        self.nested_i64(self.fields().available)
    }

    pub fn conditions(&self) -> Vec<WorkloadCondition> {
        self.nested(&["status", "conditions"])
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn condition(&self, type_: &str) -> Option<WorkloadCondition> {
        self.conditions().into_iter().find(|c| c.type_ == type_)
    }

    /// Name of a resource of `kind` listed under `status.resources`; the
    /// last listed wins
    pub fn status_resource(&self, kind: &str) -> Option<String> {
        self.obj
            .data
            .pointer("/status/resources")?
            .as_array()?
            .iter()
            .filter(|r| r.get("kind").and_then(Value::as_str) == Some(kind))
            .filter_map(|r| r.get("name").and_then(Value::as_str))
            .last()
            .map(String::from)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.obj.metadata.labels.clone().unwrap_or_default()
    }

    pub fn spec(&self) -> Option<&'a Value> {
        self.nested(&["spec"])
    }

    /// `spec.template`, assumed to be a pod template when present
    pub fn pod_template(&self) -> Option<PodTemplateSpec> {
        self.nested(&["spec", "template"])
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn nested(&self, path: &[&str]) -> Option<&'a Value> {
        path.iter()
            .try_fold(&self.obj.data, |value, key| value.get(*key))
    }

    fn nested_i64(&self, path: &[&str]) -> Option<i64> {
        self.nested(path).and_then(Value::as_i64)
    }
}

/// A change applied to a workload through a merge patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadMutation {
    /// Set `spec.replicas`
    Replicas(i32),
    /// Set (Some) or remove (None) a pod template node selector entry
    NodeSelector { key: String, value: Option<String> },
}

impl WorkloadMutation {
    /// Apply to a full object tree (as serialized from a `DynamicObject`)
    pub fn apply(&self, object: &mut Value) {
        match self {
            WorkloadMutation::Replicas(replicas) => {
                let spec = ensure_object(object, "spec");
                spec.insert("replicas".to_string(), Value::from(*replicas));
            }
            WorkloadMutation::NodeSelector { key, value } => {
                let spec = ensure_object(object, "spec");
                let template = ensure_object_in(spec, "template");
                let pod_spec = ensure_object_in(template, "spec");
                let selector = ensure_object_in(pod_spec, "nodeSelector");
                match value {
                    Some(v) => {
                        selector.insert(key.clone(), Value::String(v.clone()));
                    }
                    None => {
                        selector.remove(key);
                    }
                }
            }
        }
    }
}

fn ensure_object<'v>(value: &'v mut Value, key: &str) -> &'v mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => ensure_object_in(map, key),
        _ => unreachable!("value was just made an object"),
    }
}

fn ensure_object_in<'v>(map: &'v mut Map<String, Value>, key: &str) -> &'v mut Map<String, Value> {
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(inner) => inner,
        _ => unreachable!("entry was just made an object"),
    }
}

/// JSON merge patch (RFC 7386) turning `before` into `after`
///
/// Only changed keys are emitted; removed keys become `null`. An empty object
/// means nothing changed.
pub fn merge_patch_diff(before: &Value, after: &Value) -> Value {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, old_value) in old {
                match new.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) if new_value != old_value => {
                        patch.insert(key.clone(), merge_patch_diff(old_value, new_value));
                    }
                    Some(_) => {}
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            Value::Object(patch)
        }
        _ => after.clone(),
    }
}

/// Named container ports discovered from a pod template
///
/// Unnamed ports get `tcp-<container>-<index>`; a port equal to the canary's
/// service port is skipped since the service already exposes it.
pub fn discover_ports(template: &PodTemplateSpec, service_port: i32) -> BTreeMap<String, i32> {
    let mut ports = BTreeMap::new();
    let containers = template
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    for container in containers {
        for (i, port) in container.ports.iter().flatten().enumerate() {
            if port.container_port == service_port {
                continue;
            }
            let name = match port.name.as_deref() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => format!("tcp-{}-{}", container.name, i),
            };
            ports.insert(name, port.container_port);
        }
    }

    ports
}

#[cfg(test)]
#[path = "workload_test.rs"]
mod tests;
