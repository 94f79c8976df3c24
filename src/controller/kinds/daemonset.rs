//! DaemonSet-like controller
//!
//! A DaemonSet has no replica count. Scaling to zero pins its pods to a node
//! selector no node carries; scaling to any positive count removes it again.

use super::{
    primary_ref, require_ready, target_ref, verdict_for, workload_metadata, CanaryController,
    Context, ControllerError, WorkloadMetadata,
};
use crate::controller::readiness::Verdict;
use crate::controller::workload::{WorkloadMutation, WorkloadRef, SCALE_TO_ZERO_NODE_SELECTOR};
use crate::crd::canary::Canary;
use crate::router::{ScaleTarget, Scaler};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DaemonSetController {
    ctx: Arc<Context>,
}

impl DaemonSetController {
    pub fn new(ctx: Arc<Context>) -> Self {
        DaemonSetController { ctx }
    }
}

/// Node selector mutation equivalent to scaling to `replicas`
pub fn scale_mutation(replicas: i32) -> WorkloadMutation {
    WorkloadMutation::NodeSelector {
        key: SCALE_TO_ZERO_NODE_SELECTOR.to_string(),
        value: (replicas == 0).then(|| "true".to_string()),
    }
}

#[async_trait]
impl Scaler for DaemonSetController {
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
        self.ctx
            .accessor
            .patch_with(&workload, &scale_mutation(replicas))
            .await?;
        info!(
            canary = ?canary.name_any(),
            workload = %workload,
            scheduled = replicas > 0,
            "Scaled daemonset"
        );
        Ok(())
    }
}

#[async_trait]
impl CanaryController for DaemonSetController {
    fn name(&self) -> &'static str {
        "daemonset"
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
        self.scale(canary, ScaleTarget::Canary, 0).await?;
        self.scale(canary, ScaleTarget::Primary, 1).await
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
        self.scale(canary, ScaleTarget::Canary, 1).await
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
        Ok(applied.is_none() || current.as_deref() != applied)
    }

    async fn finalize(&self, canary: &Canary) -> Result<(), ControllerError> {
        self.scale(canary, ScaleTarget::Primary, 1).await
    }
}
