//! Replica-scaling route coordinator
//!
//! Wraps an inner router and keeps the baseline and canary replica counts in
//! proportion to the traffic split. Promoted and failed canaries take a
//! single-step fast path instead of the proportional split.

use super::{MeshRouter, RouteWeights, RouterError, ScaleTarget, Scaler};
use crate::crd::canary::Canary;
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{error, info};

/// Replica split `(primary, canary)` for a canary weight.
///
/// An explicit canary replica override wins over the proportional count.
/// A canary receiving traffic keeps at least one replica, and the primary
/// keeps at least one until the canary takes all traffic.
pub fn compute_replica_split(canary_weight: i32, max_replicas: i32, canary_replicas: i32) -> (i32, i32) {
    let weight = canary_weight.clamp(0, 100);
    let max = max_replicas.max(0);

    let mut canary = if canary_replicas > 0 {
        canary_replicas
    } else {
        // ceil(weight * max / 100) in i64; the result never exceeds max
        ((i64::from(weight) * i64::from(max) + 99) / 100) as i32
    };
    if canary == 0 && weight > 0 {
        canary = 1;
    }

    let mut primary = (max - canary).max(0);
    if primary == 0 && weight != 100 {
        primary = 1;
    }
    (primary, canary)
}

/// Coordinator over an inner router.
///
/// Holds only the scaling capability of a controller, never the controller.
pub struct ReplicaRouter<'a> {
    inner: &'a dyn MeshRouter,
    scaler: &'a dyn Scaler,
}

impl<'a> ReplicaRouter<'a> {
    pub fn new(inner: &'a dyn MeshRouter, scaler: &'a dyn Scaler) -> Self {
        ReplicaRouter { inner, scaler }
    }

    async fn scale(
        &self,
        canary: &Canary,
        role: ScaleTarget,
        replicas: i32,
    ) -> Result<(), RouterError> {
        let Err(source) = self.scaler.scale(canary, role, replicas).await else {
            return Ok(());
        };

        let (name, namespace) = match self.scaler.workload_for(canary, role).await {
            Ok(workload) => (workload.name, workload.namespace),
            Err(_) => {
                let (_, primary, _) = canary.service_names();
                let name = match role {
                    ScaleTarget::Primary => primary,
                    ScaleTarget::Canary => canary.spec.target_ref.name.clone(),
                };
                (name, canary.target_namespace().unwrap_or_default())
            }
        };
        error!(
            error = %source,
            canary = ?canary.name_any(),
            role = ?role,
            workload = ?name,
            namespace = ?namespace,
            replicas = replicas,
            "Failed to scale workload"
        );
        Err(RouterError::Scale {
            role,
            name,
            namespace,
            replicas,
            source,
        })
    }
}

#[async_trait]
impl MeshRouter for ReplicaRouter<'_> {
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        self.inner.reconcile(canary).await
    }

    async fn set_routes(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<(), RouterError> {
        let max = canary.max_replicas();

        if canary.is_promoted() {
            // baseline scale-down happens in scale_to_zero
            self.inner.set_routes(canary, 0, 100, mirrored).await?;
            self.scale(canary, ScaleTarget::Canary, max).await?;
            info!(canary = ?canary.name_any(), replicas = max, "Routed all traffic to promoted canary");
            return Ok(());
        }

        if canary.is_failed() {
            self.inner.set_routes(canary, 100, 0, mirrored).await?;
            self.scale(canary, ScaleTarget::Primary, max).await?;
            self.scale(canary, ScaleTarget::Canary, 0).await?;
            info!(canary = ?canary.name_any(), replicas = max, "Rolled traffic back to primary");
            return Ok(());
        }

        self.inner
            .set_routes(canary, primary_weight, canary_weight, mirrored)
            .await?;

        let (primary_replicas, canary_replicas) =
            compute_replica_split(canary_weight, max, canary.spec.analysis.canary_replicas);
        self.scale(canary, ScaleTarget::Canary, canary_replicas)
            .await?;
        self.scale(canary, ScaleTarget::Primary, primary_replicas)
            .await?;

        info!(
            canary = ?canary.name_any(),
            primary_weight = primary_weight,
            canary_weight = canary_weight,
            primary_replicas = primary_replicas,
            canary_replicas = canary_replicas,
            "Applied traffic split"
        );
        Ok(())
    }

    async fn get_routes(&self, canary: &Canary) -> Result<RouteWeights, RouterError> {
        self.inner.get_routes(canary).await
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "replica_test.rs"]
mod tests;
