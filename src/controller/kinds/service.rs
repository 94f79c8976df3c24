//! Service-only controller
//!
//! The canary routes between two existing Services and owns no workloads:
//! readiness is always granted and scaling does nothing.

use super::{primary_ref, target_ref, CanaryController, Context, ControllerError, WorkloadMetadata};
use crate::controller::readiness::Verdict;
use crate::controller::workload::WorkloadRef;
use crate::crd::canary::Canary;
use crate::router::{ScaleTarget, Scaler};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::debug;

pub struct ServiceController {
    ctx: Arc<Context>,
}

impl ServiceController {
    pub fn new(ctx: Arc<Context>) -> Self {
        ServiceController { ctx }
    }
}

#[async_trait]
impl Scaler for ServiceController {
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
        debug!(
            canary = ?canary.name_any(),
            target = ?target,
            replicas = replicas,
            "Service target has no replicas to scale"
        );
        Ok(())
    }
}

#[async_trait]
impl CanaryController for ServiceController {
    fn name(&self) -> &'static str {
        "service"
    }

    fn context(&self) -> &Context {
        &self.ctx
    }

    fn scaler(&self) -> &dyn Scaler {
        self
    }

    async fn initialize(&self, _canary: &mut Canary) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn is_primary_ready(&self, _canary: &Canary) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn is_canary_ready(&self, _canary: &Canary) -> Result<Verdict, ControllerError> {
        Ok(Verdict::Ready)
    }

    async fn scale_to_zero(&self, _canary: &Canary) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn scale_from_zero(&self, _canary: &Canary) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn get_metadata(&self, _canary: &Canary) -> Result<WorkloadMetadata, ControllerError> {
        Ok(WorkloadMetadata::default())
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

    async fn have_dependencies_changed(&self, _canary: &Canary) -> Result<bool, ControllerError> {
        Ok(false)
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), ControllerError> {
        Ok(())
    }
}
