//! Workload Accessor
//!
//! Generic get / list / patch against arbitrarily-kinded workloads. Errors are
//! propagated as-is; the controller layer decides what is retriable.

use crate::controller::workload::{merge_patch_diff, WorkloadMutation, WorkloadRef};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ControllerRevision;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::Client;
use thiserror::Error;
use tracing::{debug, error, info};

/// Label on revision history objects naming the owning component
pub const REVISION_COMPONENT_LABEL: &str = "controller.oam.dev/component";

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{kind} {name}.{namespace} not found")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("cannot resolve API resource for {0}")]
    Discovery(String),

    #[error("malformed workload object: {0}")]
    Malformed(String),
}

impl AccessError {
    pub fn is_not_found(&self) -> bool {
        match self {
            AccessError::NotFound { .. } => true,
            AccessError::KubeError(kube::Error::Api(err)) => err.code == 404,
            _ => false,
        }
    }

    fn not_found(workload: &WorkloadRef) -> Self {
        AccessError::NotFound {
            kind: workload.kind.clone(),
            name: workload.name.clone(),
            namespace: workload.namespace.clone(),
        }
    }
}

#[async_trait]
pub trait WorkloadAccessor: Send + Sync {
    /// Fetch the live object; a missing object is `AccessError::NotFound`
    async fn get(&self, workload: &WorkloadRef) -> Result<DynamicObject, AccessError>;

    /// Revision history of one component
    async fn list_revisions(
        &self,
        namespace: &str,
        component: &str,
    ) -> Result<Vec<ControllerRevision>, AccessError>;

    /// Read, mutate, and submit the diff against the snapshot as a merge patch
    async fn patch_with(
        &self,
        workload: &WorkloadRef,
        mutation: &WorkloadMutation,
    ) -> Result<(), AccessError>;

    /// Set replicas through the scale subresource
    async fn scale_subresource(
        &self,
        workload: &WorkloadRef,
        replicas: i32,
    ) -> Result<(), AccessError>;

    /// Set `spec.replicas` with a merge patch
    async fn scale(&self, workload: &WorkloadRef, replicas: i32) -> Result<(), AccessError> {
        self.patch_with(workload, &WorkloadMutation::Replicas(replicas))
            .await
    }
}

/// Accessor backed by the API server
///
/// Nothing is cached: informer caches can lag the API server, so every call
/// reads fresh.
pub struct KubeWorkloadAccessor {
    client: Client,
}

impl KubeWorkloadAccessor {
    pub fn new(client: Client) -> Self {
        KubeWorkloadAccessor { client }
    }

    async fn api_for(&self, workload: &WorkloadRef) -> Result<Api<DynamicObject>, AccessError> {
        let ar = self.resolve(workload).await?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            &workload.namespace,
            &ar,
        ))
    }

    async fn resolve(&self, workload: &WorkloadRef) -> Result<ApiResource, AccessError> {
        let gvk = workload.gvk();
        let (ar, _caps) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| {
                AccessError::Discovery(format!("{}/{}: {}", workload.api_version, workload.kind, e))
            })?;
        Ok(ar)
    }
}

#[async_trait]
impl WorkloadAccessor for KubeWorkloadAccessor {
    async fn get(&self, workload: &WorkloadRef) -> Result<DynamicObject, AccessError> {
        let api = self.api_for(workload).await?;
        match api.get(&workload.name).await {
            Ok(obj) => Ok(obj),
            Err(kube::Error::Api(err)) if err.code == 404 => Err(AccessError::not_found(workload)),
            Err(e) => Err(AccessError::KubeError(e)),
        }
    }

    async fn list_revisions(
        &self,
        namespace: &str,
        component: &str,
    ) -> Result<Vec<ControllerRevision>, AccessError> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{}={}", REVISION_COMPONENT_LABEL, component);
        let revisions = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(revisions.items)
    }

    async fn patch_with(
        &self,
        workload: &WorkloadRef,
        mutation: &WorkloadMutation,
    ) -> Result<(), AccessError> {
        let api = self.api_for(workload).await?;
        let current = match api.get(&workload.name).await {
            Ok(obj) => obj,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return Err(AccessError::not_found(workload))
            }
            Err(e) => return Err(AccessError::KubeError(e)),
        };

        let before = serde_json::to_value(&current)
            .map_err(|e| AccessError::Malformed(e.to_string()))?;
        let mut after = before.clone();
        mutation.apply(&mut after);
        let patch = merge_patch_diff(&before, &after);

        if patch.as_object().is_some_and(|p| p.is_empty()) {
            debug!(
                workload = %workload,
                mutation = ?mutation,
                "Workload already at desired state, skipping patch"
            );
            return Ok(());
        }

        info!(
            workload = %workload,
            gvk = ?workload.gvk(),
            mutation = ?mutation,
            "Patching workload"
        );

        api.patch(&workload.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                error!(error = ?e, workload = %workload, "Failed to patch workload");
                AccessError::KubeError(e)
            })?;
        Ok(())
    }

    async fn scale_subresource(
        &self,
        workload: &WorkloadRef,
        replicas: i32,
    ) -> Result<(), AccessError> {
        let api = self.api_for(workload).await?;
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });

        info!(
            workload = %workload,
            gvk = ?workload.gvk(),
            replicas = replicas,
            "Scaling workload through scale subresource"
        );

        api.patch_scale(&workload.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                error!(error = ?e, workload = %workload, replicas = replicas, "Failed to scale workload");
                AccessError::KubeError(e)
            })?;
        Ok(())
    }
}

/// In-memory accessor for tests
///
/// Objects live in a map keyed by (namespace, name); every mutating call is
/// recorded so tests can assert on the exact scale sequence.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Patch(String, WorkloadMutation),
        ScaleSubresource(String, i32),
    }

    #[derive(Default, Clone)]
    pub struct FakeAccessor {
        objects: Arc<Mutex<BTreeMap<(String, String), DynamicObject>>>,
        revisions: Arc<Mutex<Vec<ControllerRevision>>>,
        calls: Arc<Mutex<Vec<Call>>>,
        fail_patch_for: Arc<Mutex<Option<String>>>,
    }

    #[allow(clippy::unwrap_used)]
    impl FakeAccessor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, obj: DynamicObject) {
            let key = (
                obj.metadata.namespace.clone().unwrap_or_default(),
                obj.metadata.name.clone().unwrap_or_default(),
            );
            self.objects.lock().unwrap().insert(key, obj);
        }

        pub fn add_revision(&self, revision: ControllerRevision) {
            self.revisions.lock().unwrap().push(revision);
        }

        pub fn fail_patches_for(&self, name: &str) {
            *self.fail_patch_for.lock().unwrap() = Some(name.to_string());
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        /// Final replica count per workload name, in call order
        pub fn replicas_of(&self, name: &str) -> Option<i32> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Patch(n, WorkloadMutation::Replicas(r)) if n == name => Some(r),
                    Call::ScaleSubresource(n, r) if n == name => Some(r),
                    _ => None,
                })
                .last()
        }

        pub fn object(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
            self.objects
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }
    }

    #[async_trait]
    #[allow(clippy::unwrap_used)]
    impl WorkloadAccessor for FakeAccessor {
        async fn get(&self, workload: &WorkloadRef) -> Result<DynamicObject, AccessError> {
            self.object(&workload.namespace, &workload.name)
                .ok_or_else(|| AccessError::not_found(workload))
        }

        async fn list_revisions(
            &self,
            namespace: &str,
            component: &str,
        ) -> Result<Vec<ControllerRevision>, AccessError> {
            Ok(self
                .revisions
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.metadata.namespace.as_deref() == Some(namespace))
                .filter(|r| {
                    r.metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(REVISION_COMPONENT_LABEL))
                        .map(String::as_str)
                        == Some(component)
                })
                .cloned()
                .collect())
        }

        async fn patch_with(
            &self,
            workload: &WorkloadRef,
            mutation: &WorkloadMutation,
        ) -> Result<(), AccessError> {
            if self.fail_patch_for.lock().unwrap().as_deref() == Some(workload.name.as_str()) {
                return Err(AccessError::Malformed(format!(
                    "injected patch failure for {}",
                    workload.name
                )));
            }
            let current = self.get(workload).await?;
            let mut value = serde_json::to_value(&current).unwrap();
            mutation.apply(&mut value);
            self.insert(serde_json::from_value(value).unwrap());
            self.calls
                .lock()
                .unwrap()
                .push(Call::Patch(workload.name.clone(), mutation.clone()));
            Ok(())
        }

        async fn scale_subresource(
            &self,
            workload: &WorkloadRef,
            replicas: i32,
        ) -> Result<(), AccessError> {
            self.get(workload).await?;
            self.calls
                .lock()
                .unwrap()
                .push(Call::ScaleSubresource(workload.name.clone(), replicas));
            Ok(())
        }
    }
}
