//! OAM-style swap controller
//!
//! Baseline and target are two fixed component revisions, each with its own
//! live workload. Both identities are resolved when the controller is built.
//! Promotion retires the baseline (scale to zero) while a rollback restores
//! it to full size.

use super::{
    require_ready, target_ref, verdict_for, workload_metadata, CanaryController, Context,
    ControllerError, WorkloadMetadata,
};
use crate::controller::accessor::AccessError;
use crate::controller::readiness::Verdict;
use crate::controller::source::resolve_source;
use crate::controller::workload::WorkloadRef;
use crate::crd::canary::{Canary, CanaryPhase};
use crate::router::{ScaleTarget, Scaler};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SwapController {
    ctx: Arc<Context>,
    source: WorkloadRef,
    target: WorkloadRef,
}

impl SwapController {
    pub async fn new(canary: &Canary, ctx: Arc<Context>) -> Result<Self, ControllerError> {
        let source_obj = resolve_source(canary, ctx.accessor.as_ref()).await?;
        let source = WorkloadRef::of(&source_obj).ok_or_else(|| {
            ControllerError::Access(AccessError::Malformed(
                "baseline workload lacks kind or namespace".to_string(),
            ))
        })?;

        let target = target_ref(canary)?;
        // fail construction when the target is gone
        ctx.accessor.get(&target).await?;

        info!(
            canary = ?canary.name_any(),
            source = %source,
            target = %target,
            "Resolved swap workloads"
        );
        Ok(SwapController {
            ctx,
            source,
            target,
        })
    }

    pub fn source(&self) -> &WorkloadRef {
        &self.source
    }
}

#[async_trait]
impl Scaler for SwapController {
    async fn workload_for(
        &self,
        _canary: &Canary,
        target: ScaleTarget,
    ) -> Result<WorkloadRef, ControllerError> {
        Ok(match target {
            ScaleTarget::Primary => self.source.clone(),
            ScaleTarget::Canary => self.target.clone(),
        })
    }

    async fn scale(
        &self,
        canary: &Canary,
        target: ScaleTarget,
        replicas: i32,
    ) -> Result<(), ControllerError> {
        let workload = match target {
            ScaleTarget::Primary => &self.source,
            ScaleTarget::Canary => &self.target,
        };
        self.ctx.accessor.scale(workload, replicas).await?;
        info!(
            canary = ?canary.name_any(),
            workload = %workload,
            role = ?target,
            replicas = replicas,
            "Scaled workload"
        );
        Ok(())
    }
}

#[async_trait]
impl CanaryController for SwapController {
    fn name(&self) -> &'static str {
        "swap"
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
        self.scale(canary, ScaleTarget::Primary, canary.max_replicas())
            .await
    }

    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), ControllerError> {
        let obj = self.ctx.accessor.get(&self.source).await?;
        require_ready(verdict_for(&self.ctx, canary, &obj).await?, &obj)
    }

    async fn is_canary_ready(&self, canary: &Canary) -> Result<Verdict, ControllerError> {
        let obj = self.ctx.accessor.get(&self.target).await?;
        verdict_for(&self.ctx, canary, &obj).await
    }

    async fn scale_to_zero(&self, canary: &Canary) -> Result<(), ControllerError> {
        if canary.is_promoted() {
            self.scale(canary, ScaleTarget::Primary, 0).await
        } else {
            // rollback
            self.scale(canary, ScaleTarget::Primary, canary.max_replicas())
                .await
        }
    }

    /// Cold start from zero is only needed for autoscaled targets
    async fn scale_from_zero(&self, _canary: &Canary) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn get_metadata(&self, canary: &Canary) -> Result<WorkloadMetadata, ControllerError> {
        let obj = self.ctx.accessor.get(&self.target).await?;
        workload_metadata(&self.ctx, canary, &obj)
    }

    /// The target never changes by itself; report a change once while
    /// Initialized so the canary can leave that phase
    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, ControllerError> {
        Ok(canary.phase() == CanaryPhase::Initialized)
    }

    async fn finalize(&self, canary: &Canary) -> Result<(), ControllerError> {
        self.scale(canary, ScaleTarget::Primary, canary.max_replicas())
            .await
    }
}

#[cfg(test)]
#[path = "swap_test.rs"]
mod tests;
