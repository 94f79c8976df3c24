//! Generic rollout controller
//!
//! Drives any workload kind publishing the standard replica counters. The
//! baseline is resolved once per controller from revision history (or
//! `sourceRef`); its status is still fetched fresh on every check. There is
//! no cold start: once Initialized the canary moves straight to Progressing.

use super::{
    require_ready, target_ref, verdict_for, workload_metadata, CanaryController, Context,
    ControllerError, WorkloadMetadata,
};
use crate::controller::accessor::AccessError;
use crate::controller::readiness::Verdict;
use crate::controller::source::resolve_source;
use crate::controller::status::StatusDelta;
use crate::controller::workload::WorkloadRef;
use crate::crd::canary::{Canary, CanaryPhase};
use crate::router::{ScaleTarget, Scaler};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

pub struct RollingController {
    ctx: Arc<Context>,
    source: OnceCell<WorkloadRef>,
}

impl RollingController {
    pub fn new(ctx: Arc<Context>) -> Self {
        RollingController {
            ctx,
            source: OnceCell::new(),
        }
    }

    async fn source_ref(&self, canary: &Canary) -> Result<&WorkloadRef, ControllerError> {
        self.source
            .get_or_try_init(|| async {
                let obj = resolve_source(canary, self.ctx.accessor.as_ref()).await?;
                WorkloadRef::of(&obj).ok_or_else(|| {
                    ControllerError::Access(AccessError::Malformed(
                        "baseline workload lacks kind or namespace".to_string(),
                    ))
                })
            })
            .await
    }
}

#[async_trait]
impl Scaler for RollingController {
    async fn workload_for(
        &self,
        canary: &Canary,
        target: ScaleTarget,
    ) -> Result<WorkloadRef, ControllerError> {
        match target {
            ScaleTarget::Primary => self.source_ref(canary).await.cloned(),
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
            .scale_subresource(&workload, replicas)
            .await?;
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
impl CanaryController for RollingController {
    fn name(&self) -> &'static str {
        "rolling"
    }

    fn context(&self) -> &Context {
        &self.ctx
    }

    fn scaler(&self) -> &dyn Scaler {
        self
    }

    async fn initialize(&self, canary: &mut Canary) -> Result<(), ControllerError> {
        self.source_ref(canary).await?;

        if canary.is_initializing() && !canary.skip_analysis() {
            self.is_primary_ready(canary).await?;
        }

        // the rollout is already underway, nothing creates the canary
        if canary.is_initialized() {
            self.sync_status(canary, StatusDelta::phase(CanaryPhase::Progressing))
                .await?;
        }
        Ok(())
    }

    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), ControllerError> {
        let source = self.source_ref(canary).await?;
        let obj = self.ctx.accessor.get(source).await?;
        require_ready(verdict_for(&self.ctx, canary, &obj).await?, &obj)
    }

    async fn is_canary_ready(&self, canary: &Canary) -> Result<Verdict, ControllerError> {
        let target = self.ctx.accessor.get(&target_ref(canary)?).await?;
        verdict_for(&self.ctx, canary, &target).await
    }

    async fn scale_to_zero(&self, _canary: &Canary) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn scale_from_zero(&self, _canary: &Canary) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn get_metadata(&self, canary: &Canary) -> Result<WorkloadMetadata, ControllerError> {
        let target = self.ctx.accessor.get(&target_ref(canary)?).await?;
        workload_metadata(&self.ctx, canary, &target)
    }

    /// The target sits on a fixed revision
    async fn has_target_changed(&self, _canary: &Canary) -> Result<bool, ControllerError> {
        Ok(false)
    }

    async fn finalize(&self, canary: &Canary) -> Result<(), ControllerError> {
        self.scale(canary, ScaleTarget::Primary, canary.max_replicas())
            .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::controller::accessor::fake::Call;
    use crate::controller::fixtures::{self, NAMESPACE};
    use crate::controller::kinds::testing::{harness, Harness};
    use serde_json::json;

    fn labels() -> serde_json::Value {
        json!({"app": "podinfo", "app.oam.dev/component": "podinfo"})
    }

    fn rolling_canary() -> Canary {
        let mut canary = fixtures::canary("CloneSet", "podinfo-v2");
        canary.spec.strategy = Some("rolling".to_string());
        canary
    }

    fn setup(canary: &Canary) -> Harness {
        let h = harness(canary);
        h.accessor
            .insert(fixtures::ready_workload("CloneSet", "podinfo-v2", 1, labels()));
        h.accessor
            .insert(fixtures::ready_workload("CloneSet", "podinfo-v1", 3, labels()));
        h.accessor
            .add_revision(fixtures::revision("podinfo-v2", 2, "podinfo", json!({})));
        h.accessor
            .add_revision(fixtures::revision("podinfo-v1", 1, "podinfo", json!({})));
        h
    }

    #[tokio::test]
    async fn test_initialized_canary_moves_to_progressing() {
        let canary = rolling_canary();
        let h = setup(&canary);
        let mut canary = fixtures::with_phase(canary, CanaryPhase::Initialized);
        h.store.put(canary.clone());

        let controller = RollingController::new(h.ctx.clone());
        controller.initialize(&mut canary).await.unwrap();

        assert_eq!(canary.phase(), CanaryPhase::Progressing);
        assert_eq!(
            h.store.status_of(NAMESPACE, "podinfo").phase,
            Some(CanaryPhase::Progressing)
        );
        assert!(h.accessor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_requires_ready_baseline() {
        let mut canary = rolling_canary();
        let h = setup(&canary);
        h.accessor.insert(fixtures::progressing_workload("CloneSet", "podinfo-v1", labels()));

        let controller = RollingController::new(h.ctx.clone());
        let err = controller.initialize(&mut canary).await.unwrap_err();
        assert!(matches!(err, ControllerError::NotReady { retriable: true, .. }));
    }

    #[tokio::test]
    async fn test_finalize_scales_baseline_through_subresource() {
        let canary = rolling_canary();
        let h = setup(&canary);

        let controller = RollingController::new(h.ctx.clone());
        controller.finalize(&canary).await.unwrap();

        assert_eq!(
            h.accessor.calls(),
            vec![Call::ScaleSubresource("podinfo-v1".to_string(), 7)]
        );
    }

    #[tokio::test]
    async fn test_target_never_changes_and_zero_scaling_is_noop() {
        let canary = rolling_canary();
        let h = setup(&canary);
        let controller = RollingController::new(h.ctx.clone());

        assert!(!controller.has_target_changed(&canary).await.unwrap());
        controller.scale_to_zero(&canary).await.unwrap();
        controller.scale_from_zero(&canary).await.unwrap();
        assert!(h.accessor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_canary_readiness_follows_podspec_deployment() {
        let mut canary = rolling_canary();
        canary.spec.target_ref.kind = "PodSpecWorkload".to_string();
        let h = setup(&canary);
        h.accessor.insert(fixtures::workload(
            "PodSpecWorkload",
            "podinfo-v2",
            json!({"replicas": 1}),
            json!({
                "observedGeneration": 1,
                "resources": [{"apiVersion": "apps/v1", "kind": "Deployment", "name": "podinfo-v2-abc"}]
            }),
            labels(),
        ));
        h.accessor
            .insert(fixtures::progressing_workload("Deployment", "podinfo-v2-abc", labels()));
        let controller = RollingController::new(h.ctx.clone());

        let verdict = controller.is_canary_ready(&canary).await.unwrap();
        assert!(!verdict.is_ready());
        assert!(verdict.is_retriable());

        h.accessor
            .insert(fixtures::ready_workload("Deployment", "podinfo-v2-abc", 1, labels()));
        assert!(controller.is_canary_ready(&canary).await.unwrap().is_ready());
    }
}
