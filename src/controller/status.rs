//! Canary status persistence
//!
//! Status is never written wholesale from an in-memory copy. Every write
//! re-reads the canary, merges a `StatusDelta` into the fresh status and
//! submits it guarded by the fresh resourceVersion. Conflicts are retried a
//! bounded number of times.

use crate::config::ControllerConfig;
use crate::controller::clock::Clock;
use crate::controller::workload::merge_patch_diff;
use crate::controller::kinds::ControllerError;
use crate::crd::canary::{Canary, CanaryPhase, CanaryStatus};
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("canary {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("status write conflict: {0}")]
    Conflict(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("canary status cannot be encoded: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait CanaryStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Canary, StoreError>;

    /// Write `status` onto `canary`, failing with `Conflict` when the stored
    /// resourceVersion moved past the one `canary` was read at
    async fn patch_status(
        &self,
        canary: &Canary,
        status: &CanaryStatus,
    ) -> Result<Canary, StoreError>;
}

pub struct KubeCanaryStore {
    client: Client,
}

impl KubeCanaryStore {
    pub fn new(client: Client) -> Self {
        KubeCanaryStore { client }
    }
}

#[async_trait]
impl CanaryStore for KubeCanaryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Canary, StoreError> {
        let api: Api<Canary> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(canary) => Ok(canary),
            Err(kube::Error::Api(err)) if err.code == 404 => Err(StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(StoreError::KubeError(e)),
        }
    }

    async fn patch_status(
        &self,
        canary: &Canary,
        status: &CanaryStatus,
    ) -> Result<Canary, StoreError> {
        let namespace = canary.namespace().unwrap_or_default();
        let api: Api<Canary> = Api::namespaced(self.client.clone(), &namespace);

        let patch = status_patch(canary, status)?;

        match api
            .patch_status(&canary.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                Err(StoreError::Conflict(err.message.clone()))
            }
            Err(e) => Err(StoreError::KubeError(e)),
        }
    }
}

/// Merge patch moving `canary`'s stored status to `status`.
///
/// The status part is a diff, so fields and map keys that disappeared are
/// sent as `null`. The resourceVersion makes the API server reject writes
/// based on a stale read.
pub fn status_patch(canary: &Canary, status: &CanaryStatus) -> Result<Value, StoreError> {
    let encode = |s: &CanaryStatus| {
        serde_json::to_value(s).map_err(|e| StoreError::Malformed(e.to_string()))
    };
    let before = encode(&canary.status.clone().unwrap_or_default())?;
    let after = encode(status)?;
    Ok(serde_json::json!({
        "metadata": { "resourceVersion": canary.resource_version() },
        "status": merge_patch_diff(&before, &after)
    }))
}

/// Fields to change in a canary's status; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusDelta {
    pub phase: Option<CanaryPhase>,
    pub canary_weight: Option<i32>,
    pub failed_checks: Option<i32>,
    pub iterations: Option<i32>,
    pub tracked_configs: Option<BTreeMap<String, String>>,
    pub last_applied_spec: Option<String>,
}

impl StatusDelta {
    pub fn phase(phase: CanaryPhase) -> Self {
        StatusDelta {
            phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn weight(weight: i32) -> Self {
        StatusDelta {
            canary_weight: Some(weight),
            ..Default::default()
        }
    }

    pub fn failed_checks(count: i32) -> Self {
        StatusDelta {
            failed_checks: Some(count),
            ..Default::default()
        }
    }

    pub fn iterations(count: i32) -> Self {
        StatusDelta {
            iterations: Some(count),
            ..Default::default()
        }
    }

    /// Merge into `status`, stamping `now` when the phase changes
    pub fn apply(&self, status: &mut CanaryStatus, now: chrono::DateTime<chrono::Utc>) {
        if let Some(phase) = self.phase {
            if status.phase != Some(phase) {
                status.last_transition_time = Some(now.to_rfc3339());
            }
            status.phase = Some(phase);
        }
        if let Some(weight) = self.canary_weight {
            status.canary_weight = weight;
        }
        if let Some(count) = self.failed_checks {
            status.failed_checks = count;
        }
        if let Some(count) = self.iterations {
            status.iterations = count;
        }
        if let Some(configs) = &self.tracked_configs {
            // nothing to track clears the field
            status.tracked_configs = (!configs.is_empty()).then(|| configs.clone());
        }
        if let Some(hash) = &self.last_applied_spec {
            status.last_applied_spec = Some(hash.clone());
        }

        // a spec that reached a stable phase becomes the promoted baseline
        if matches!(
            self.phase,
            Some(CanaryPhase::Succeeded) | Some(CanaryPhase::Initialized)
        ) {
            if let Some(hash) = &status.last_applied_spec {
                status.last_promoted_spec = Some(hash.clone());
            }
        }
    }
}

/// Stable hash of a workload spec for change detection
///
/// FNV-1a over the canonical JSON text; object keys serialize sorted so the
/// hash is identical across processes.
pub fn compute_spec_hash(spec: &Value) -> String {
    let json = spec.to_string();

    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in json.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }

    format!("{hash:016x}")
}

/// Read-modify-write of the canary status with bounded conflict retries
///
/// On success the caller's copy is replaced by the stored canary, so later
/// steps of the same reconciliation never act on stale status.
pub async fn update_status_with_retry(
    store: &dyn CanaryStore,
    clock: &dyn Clock,
    config: &ControllerConfig,
    canary: &mut Canary,
    delta: &StatusDelta,
) -> Result<(), ControllerError> {
    let name = canary.name_any();
    let namespace = canary.namespace().unwrap_or_default();
    let attempts = config.status_retry_attempts.max(1);

    for attempt in 1..=attempts {
        let fresh = store.get(&namespace, &name).await?;
        let current = fresh.status.clone().unwrap_or_default();
        let mut desired = current.clone();
        delta.apply(&mut desired, clock.now());

        if desired == current {
            debug!(canary = ?name, namespace = %namespace, "Status already up to date");
            *canary = fresh;
            return Ok(());
        }

        match store.patch_status(&fresh, &desired).await {
            Ok(updated) => {
                if desired.phase != current.phase {
                    info!(
                        canary = ?name,
                        namespace = %namespace,
                        from = ?current.phase,
                        to = ?desired.phase,
                        "Canary phase changed"
                    );
                }
                *canary = updated;
                return Ok(());
            }
            Err(StoreError::Conflict(message)) => {
                warn!(
                    canary = ?name,
                    namespace = %namespace,
                    attempt = attempt,
                    error = %message,
                    "Status update conflicted, retrying with fresh read"
                );
                if attempt < attempts {
                    tokio::time::sleep(config.status_retry_backoff).await;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(ControllerError::StatusConflict {
        name,
        namespace,
        attempts,
    })
}


#[cfg(test)]
#[path = "status_test.rs"]
mod tests;
