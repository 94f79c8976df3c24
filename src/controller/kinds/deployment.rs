//! Deployment-like controller
//!
//! Baseline is `sourceRef` or `<target>-primary`. Both are fetched fresh on
//! every call and scaled through merge patches of `spec.replicas`. Also the
//! fallback for kinds without a dedicated controller.

use super::{
    primary_ref, require_ready, target_ref, verdict_for, workload_metadata, CanaryController,
    Context, ControllerError, WorkloadMetadata,
};
use crate::controller::readiness::Verdict;
use crate::controller::workload::WorkloadRef;
use crate::crd::canary::Canary;
use crate::router::{ScaleTarget, Scaler};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DeploymentController {
    ctx: Arc<Context>,
}

impl DeploymentController {
    pub fn new(ctx: Arc<Context>) -> Self {
        DeploymentController { ctx }
    }

    async fn scale_logged(
        &self,
        canary: &Canary,
        workload: &WorkloadRef,
        replicas: i32,
    ) -> Result<(), ControllerError> {
        self.ctx.accessor.scale(workload, replicas).await?;
        info!(
            canary = ?canary.name_any(),
            workload = %workload,
            replicas = replicas,
            "Scaled workload"
        );
        Ok(())
    }
}

#[async_trait]
impl Scaler for DeploymentController {
    async fn workload_for(
        &self,
        canary: &Canary,
        target: ScaleTarget,
    ) -> Result<WorkloadRef, ControllerError> {
        match target {
            ScaleTarget::Primary => primary_ref(canary),
            ScaleTarget::Canary => target_ref(canary),
        }
    }

    async fn scale(
        &self,
        canary: &Canary,
        target: ScaleTarget,
        replicas: i32,
    ) -> Result<(), ControllerError> {
        let workload = self.workload_for(canary, target).await?;
        self.scale_logged(canary, &workload, replicas).await
    }
}

#[async_trait]
impl CanaryController for DeploymentController {
    fn name(&self) -> &'static str {
        "deployment"
    }

    fn context(&self) -> &Context {
        &self.ctx
    }

    fn scaler(&self) -> &dyn Scaler {
        self
    }

    async fn initialize(&self, canary: &mut Canary) -> Result<(), ControllerError> {
        if !canary.is_initializing() {
            debug!(canary = ?canary.name_any(), phase = ?canary.phase(), "Already initialized");
            return Ok(());
        }

        if !canary.skip_analysis() {
            self.is_primary_ready(canary).await?;
        }

        // cold start: the target only receives replicas once traffic shifts
        let target = target_ref(canary)?;
        let primary = primary_ref(canary)?;
        self.scale_logged(canary, &target, 0).await?;
        self.scale_logged(canary, &primary, canary.max_replicas())
            .await?;
        Ok(())
    }

    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), ControllerError> {
        let primary = self.ctx.accessor.get(&primary_ref(canary)?).await?;
        require_ready(verdict_for(&self.ctx, canary, &primary).await?, &primary)
    }

    async fn is_canary_ready(&self, canary: &Canary) -> Result<Verdict, ControllerError> {
        let target = self.ctx.accessor.get(&target_ref(canary)?).await?;
        verdict_for(&self.ctx, canary, &target).await
    }

    async fn scale_to_zero(&self, canary: &Canary) -> Result<(), ControllerError> {
        self.scale(canary, ScaleTarget::Canary, 0).await
    }

    async fn scale_from_zero(&self, canary: &Canary) -> Result<(), ControllerError> {
        let replicas = canary.spec.analysis.canary_replicas.max(1);
        self.scale(canary, ScaleTarget::Canary, replicas).await
    }

    async fn get_metadata(&self, canary: &Canary) -> Result<WorkloadMetadata, ControllerError> {
        let target = self.ctx.accessor.get(&target_ref(canary)?).await?;
        workload_metadata(&self.ctx, canary, &target)
    }

    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, ControllerError> {
        let current = self.target_spec_hash(canary).await?;
        let applied = canary
            .status
            .as_ref()
            .and_then(|s| s.last_applied_spec.as_deref())
            .filter(|s| !s.is_empty());
        Ok(match applied {
            Some(applied) => current.as_deref() != Some(applied),
            None => true,
        })
    }

    async fn finalize(&self, canary: &Canary) -> Result<(), ControllerError> {
        self.scale(canary, ScaleTarget::Primary, canary.max_replicas())
            .await
    }
}

#[cfg(test)]
#[path = "deployment_test.rs"]
mod tests;
