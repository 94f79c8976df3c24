//! Baseline Workload Resolver
//!
//! Finds the workload currently serving stable traffic. An explicit
//! `sourceRef` wins; otherwise the component's revision history is scanned
//! newest first for a revision other than the target that still has a live
//! workload.

use crate::controller::accessor::WorkloadAccessor;
use crate::controller::kinds::ControllerError;
use crate::controller::workload::WorkloadRef;
use crate::crd::canary::Canary;
use k8s_openapi::api::apps::v1::ControllerRevision;
use kube::core::DynamicObject;
use serde_json::Value;
use std::cmp::Ordering;
use tracing::{debug, info};

/// Label on live workloads naming their component
pub const COMPONENT_LABEL: &str = "app.oam.dev/component";

/// Newest revision first; equal numbers fall back to name order
pub fn compare_revisions(a: &ControllerRevision, b: &ControllerRevision) -> Ordering {
    b.revision
        .cmp(&a.revision)
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

/// The workload a revision declares internally
///
/// Revision data is either a component (`spec.workload` holds the workload)
/// or the workload itself. Kind and apiVersion default to the target's.
pub fn embedded_workload_ref(
    revision: &ControllerRevision,
    target: &WorkloadRef,
) -> Option<WorkloadRef> {
    let data = &revision.data.as_ref()?.0;
    let workload = match data.pointer("/spec/workload") {
        Some(w) if w.is_object() => w,
        _ => data,
    };

    let field = |v: &Value, path: &str| {
        v.pointer(path)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };

    let name = field(workload, "/metadata/name")?;
    Some(WorkloadRef {
        api_version: field(workload, "/apiVersion").unwrap_or_else(|| target.api_version.clone()),
        kind: field(workload, "/kind").unwrap_or_else(|| target.kind.clone()),
        name,
        namespace: field(workload, "/metadata/namespace")
            .unwrap_or_else(|| target.namespace.clone()),
    })
}

/// Resolve the baseline workload of a canary
pub async fn resolve_source(
    canary: &Canary,
    accessor: &dyn WorkloadAccessor,
) -> Result<DynamicObject, ControllerError> {
    let target = WorkloadRef::target_of(canary).ok_or_else(|| {
        ControllerError::Configuration("canary has no namespace to resolve its target in".into())
    })?;

    if let Some(source_ref) = &canary.spec.source_ref {
        let source = WorkloadRef::from_reference(source_ref, &target.namespace);
        return accessor.get(&source).await.map_err(|e| {
            ControllerError::SourceNotFound(format!("baseline {} not found: {}", source, e))
        });
    }

    let target_obj = accessor.get(&target).await?;
    let component = target_obj
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(COMPONENT_LABEL))
        .cloned()
        .ok_or_else(|| {
            ControllerError::Configuration(format!(
                "{} carries no {} label",
                target, COMPONENT_LABEL
            ))
        })?;

    let mut revisions = accessor
        .list_revisions(&target.namespace, &component)
        .await?;
    revisions.sort_by(compare_revisions);

    for revision in &revisions {
        let Some(revision_name) = revision.metadata.name.as_deref() else {
            continue;
        };
        if revision_name == target.name {
            continue;
        }

        let candidate = target.with_name(revision_name);
        match accessor.get(&candidate).await {
            Ok(obj) => {
                info!(
                    canary = ?canary.metadata.name,
                    component = %component,
                    source = %candidate,
                    revision = revision.revision,
                    "Resolved baseline workload from revision history"
                );
                return Ok(obj);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        // Revision name and live workload name differ
        let Some(embedded) = embedded_workload_ref(revision, &target) else {
            debug!(revision = revision_name, "Revision declares no workload name");
            continue;
        };
        match accessor.get(&embedded).await {
            Ok(obj) => {
                info!(
                    canary = ?canary.metadata.name,
                    component = %component,
                    source = %embedded,
                    revision = revision.revision,
                    "Resolved baseline workload from revision definition"
                );
                return Ok(obj);
            }
            Err(e) if e.is_not_found() => {
                debug!(
                    revision = revision_name,
                    workload = %embedded,
                    "Workload named by revision is gone, trying older revision"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(ControllerError::SourceNotFound(format!(
        "baseline workload not found for component {}",
        component
    )))
}

#[cfg(test)]
#[path = "source_test.rs"]
mod tests;
