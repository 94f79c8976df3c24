//! Shared builders for controller and router tests
#![allow(clippy::expect_used)]

use crate::crd::canary::{Canary, CanaryPhase, CanaryStatus};
use k8s_openapi::api::apps::v1::ControllerRevision;
use kube::core::DynamicObject;
use serde_json::{json, Value};

pub const NAMESPACE: &str = "test";

/// Canary for `podinfo` targeting a Deployment, seven replicas max
pub fn canary(target_kind: &str, target: &str) -> Canary {
    serde_json::from_value(json!({
        "apiVersion": "kulta.io/v1beta1",
        "kind": "Canary",
        "metadata": {"name": "podinfo", "namespace": NAMESPACE, "resourceVersion": "1"},
        "spec": {
            "targetRef": {"apiVersion": "apps/v1", "kind": target_kind, "name": target},
            "service": {"port": 9898},
            "analysis": {"threshold": 5, "stepWeight": 10, "maxWeight": 50, "maxReplicas": 7}
        }
    }))
    .expect("valid canary")
}

pub fn with_phase(mut canary: Canary, phase: CanaryPhase) -> Canary {
    let status = canary.status.get_or_insert_with(CanaryStatus::default);
    status.phase = Some(phase);
    canary
}

pub fn with_weight(mut canary: Canary, weight: i32) -> Canary {
    let status = canary.status.get_or_insert_with(CanaryStatus::default);
    status.canary_weight = weight;
    canary
}

/// A converged workload with the given replica count
pub fn ready_workload(kind: &str, name: &str, replicas: i64, labels: Value) -> DynamicObject {
    workload(
        kind,
        name,
        json!({
            "replicas": replicas,
            "template": {
                "metadata": {"labels": labels},
                "spec": {"containers": [{
                    "name": "podinfo",
                    "image": format!("stefanprodan/{}", name),
                    "ports": [
                        {"name": "http", "containerPort": 9898},
                        {"name": "http-metrics", "containerPort": 9797}
                    ]
                }]}
            }
        }),
        json!({
            "observedGeneration": 1,
            "replicas": replicas,
            "updatedReplicas": replicas,
            "availableReplicas": replicas
        }),
        labels,
    )
}

/// A workload whose new replicas are still rolling out
pub fn progressing_workload(kind: &str, name: &str, labels: Value) -> DynamicObject {
    workload(
        kind,
        name,
        json!({"replicas": 3}),
        json!({
            "observedGeneration": 1,
            "replicas": 3,
            "updatedReplicas": 1,
            "availableReplicas": 1
        }),
        labels,
    )
}

pub fn workload(kind: &str, name: &str, spec: Value, status: Value, labels: Value) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": kind,
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "generation": 1,
            "labels": labels
        },
        "spec": spec,
        "status": status,
    }))
    .expect("valid workload")
}

pub fn revision(name: &str, number: i64, component: &str, data: Value) -> ControllerRevision {
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "ControllerRevision",
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "labels": {"controller.oam.dev/component": component}
        },
        "revision": number,
        "data": data,
    }))
    .expect("valid revision")
}

/// Route log output through the test harness; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
