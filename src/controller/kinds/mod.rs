//! Per-workload-kind controllers
//!
//! Every workload shape a Canary can target is driven through the same
//! `CanaryController` contract. The closed set of variants:
//! - `DeploymentController`: `<target>-primary` baseline, cold start by scaling
//! - `DaemonSetController`: same naming, "scaling" through a node selector
//! - `ServiceController`: no workloads, routing only
//! - `RollingController`: generic rollout, baseline from revision history
//! - `SwapController`: OAM-style swap between two fixed revisions
//!
//! `select_controller` picks a variant by kind tag and falls back to the
//! Deployment controller for tags it does not know.

pub mod daemonset;
pub mod deployment;
pub mod rolling;
pub mod service;
pub mod swap;

use crate::config::ControllerConfig;
use crate::controller::accessor::{AccessError, KubeWorkloadAccessor, WorkloadAccessor};
use crate::controller::clock::{Clock, SystemClock};
use crate::controller::readiness::{self, Verdict};
use crate::controller::status::{
    compute_spec_hash, update_status_with_retry, CanaryStore, KubeCanaryStore, StatusDelta,
    StoreError,
};
use crate::controller::tracker::{tracked_configs, ConfigTracker, NoopConfigTracker, TrackerError};
use crate::controller::workload::{
    discover_ports, WorkloadRef, WorkloadView, SCALE_TO_ZERO_NODE_SELECTOR,
};
use crate::crd::canary::{Canary, CanaryPhase};
use crate::router::Scaler;
use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub use daemonset::DaemonSetController;
pub use deployment::DeploymentController;
pub use rolling::RollingController;
pub use service::ServiceController;
pub use swap::SwapController;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{kind} {name}.{namespace} not ready: {reason}")]
    NotReady {
        kind: String,
        name: String,
        namespace: String,
        retriable: bool,
        reason: String,
    },

    #[error("{0}")]
    SourceNotFound(String),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("status of canary {namespace}/{name} still conflicting after {attempts} attempts")]
    StatusConflict {
        name: String,
        namespace: String,
        attempts: usize,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("GetConfigRefs failed: {0}")]
    Tracker(#[from] TrackerError),

    #[error("{0} is not supported")]
    Unsupported(String),
}

impl ControllerError {
    /// Whether re-polling on a later tick can resolve the error
    ///
    /// Fatal errors (stalled or malformed workloads, missing baseline,
    /// configuration problems) should drive the canary toward Failed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ControllerError::NotReady { retriable, .. } => *retriable,
            ControllerError::Access(e) => matches!(e, AccessError::KubeError(_)) && !e.is_not_found(),
            ControllerError::Store(e) => {
                !matches!(e, StoreError::NotFound { .. } | StoreError::Malformed(_))
            }
            ControllerError::StatusConflict { .. } => true,
            ControllerError::Tracker(_) => true,
            ControllerError::SourceNotFound(_)
            | ControllerError::Configuration(_)
            | ControllerError::Unsupported(_) => false,
        }
    }
}

/// Collaborators shared by all controllers
pub struct Context {
    pub accessor: Arc<dyn WorkloadAccessor>,
    pub store: Arc<dyn CanaryStore>,
    pub tracker: Arc<dyn ConfigTracker>,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
}

impl Context {
    /// Context talking to the API server, configured from the environment
    pub fn new(client: kube::Client) -> Self {
        Context {
            accessor: Arc::new(KubeWorkloadAccessor::new(client.clone())),
            store: Arc::new(KubeCanaryStore::new(client)),
            tracker: Arc::new(NoopConfigTracker),
            clock: Arc::new(SystemClock),
            config: ControllerConfig::from_env(),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ConfigTracker>) -> Self {
        self.tracker = tracker;
        self
    }
}

/// Selector label and discovered ports used to build the canary services
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadMetadata {
    pub selector_label: Option<String>,
    pub ports: Option<BTreeMap<String, i32>>,
}

#[async_trait]
pub trait CanaryController: Send + Sync {
    /// Variant name for logs
    fn name(&self) -> &'static str;

    fn context(&self) -> &Context;

    /// Scale capability handed to the route coordinator
    fn scaler(&self) -> &dyn Scaler;

    /// First-entry setup; a no-op once the canary left Initializing
    async fn initialize(&self, canary: &mut Canary) -> Result<(), ControllerError>;

    /// `Err(NotReady)` while the baseline has not converged
    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), ControllerError>;

    /// Readiness verdict of the target; API failures are errors
    async fn is_canary_ready(&self, canary: &Canary) -> Result<Verdict, ControllerError>;

    async fn scale_to_zero(&self, canary: &Canary) -> Result<(), ControllerError>;

    async fn scale_from_zero(&self, canary: &Canary) -> Result<(), ControllerError>;

    async fn get_metadata(&self, canary: &Canary) -> Result<WorkloadMetadata, ControllerError>;

    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, ControllerError>;

    /// Restore the baseline to full size
    async fn finalize(&self, canary: &Canary) -> Result<(), ControllerError>;

    /// Hash of the target spec recorded as `lastAppliedSpec`
    async fn target_spec_hash(&self, canary: &Canary) -> Result<Option<String>, ControllerError> {
        let target = target_ref(canary)?;
        let obj = self.context().accessor.get(&target).await?;
        Ok(spec_hash_of(&obj))
    }

    /// Only acts below 100%; the caller's copy is refreshed from the store
    async fn promote(&self, canary: &mut Canary) -> Result<(), ControllerError> {
        if canary.canary_weight() == 100 {
            debug!(canary = ?canary.name_any(), "Canary already at full weight");
            return Ok(());
        }
        self.set_status_weight(canary, 100).await?;

        let ctx = self.context();
        let namespace = canary.namespace().unwrap_or_default();
        *canary = ctx.store.get(&namespace, &canary.name_any()).await?;
        info!(
            canary = ?canary.name_any(),
            controller = self.name(),
            "Canary promoted to full weight"
        );
        Ok(())
    }

    /// Merge `delta` plus tracked configs and the target spec hash
    async fn sync_status(&self, canary: &mut Canary, delta: StatusDelta) -> Result<(), ControllerError> {
        let ctx = self.context();
        let mut delta = delta;

        match ctx.tracker.get_config_refs(canary).await {
            Ok(refs) => delta.tracked_configs = Some(tracked_configs(&refs)),
            Err(e) if e.is_kind_invalid() => {
                debug!(canary = ?canary.name_any(), error = %e, "Target kind has no tracked configs");
                delta.tracked_configs = Some(BTreeMap::new());
            }
            Err(e) => return Err(e.into()),
        }

        if delta.last_applied_spec.is_none() {
            delta.last_applied_spec = self.target_spec_hash(canary).await?;
        }

        update_status_with_retry(
            ctx.store.as_ref(),
            ctx.clock.as_ref(),
            &ctx.config,
            canary,
            &delta,
        )
        .await
    }

    async fn set_status_failed_checks(&self, canary: &mut Canary, value: i32) -> Result<(), ControllerError> {
        self.write_status(canary, StatusDelta::failed_checks(value)).await
    }

    async fn set_status_weight(&self, canary: &mut Canary, value: i32) -> Result<(), ControllerError> {
        self.write_status(canary, StatusDelta::weight(value)).await
    }

    async fn set_status_iterations(&self, canary: &mut Canary, value: i32) -> Result<(), ControllerError> {
        self.write_status(canary, StatusDelta::iterations(value)).await
    }

    async fn set_status_phase(&self, canary: &mut Canary, phase: CanaryPhase) -> Result<(), ControllerError> {
        self.write_status(canary, StatusDelta::phase(phase)).await
    }

    /// Tracker answer with the invalid-kind condition read as "unchanged"
    async fn have_dependencies_changed(&self, canary: &Canary) -> Result<bool, ControllerError> {
        match self.context().tracker.has_config_changed(canary).await {
            Ok(changed) => Ok(changed),
            Err(e) if e.is_kind_invalid() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_status(&self, canary: &mut Canary, delta: StatusDelta) -> Result<(), ControllerError> {
        let ctx = self.context();
        update_status_with_retry(
            ctx.store.as_ref(),
            ctx.clock.as_ref(),
            &ctx.config,
            canary,
            &delta,
        )
        .await
    }
}

/// Pick the controller for a canary
///
/// Tags: `Deployment`, `DaemonSet`, `Service`, `rolling`, `swap`. `inplace`
/// is rejected. Any other tag gets the Deployment controller, which drives
/// every kind following the `spec.replicas` convention.
pub async fn select_controller(
    canary: &Canary,
    ctx: Arc<Context>,
) -> Result<Box<dyn CanaryController>, ControllerError> {
    let kind = canary.controller_kind().to_string();
    let controller: Box<dyn CanaryController> = match kind.as_str() {
        "Deployment" => Box::new(DeploymentController::new(ctx)),
        "DaemonSet" => Box::new(DaemonSetController::new(ctx)),
        "Service" => Box::new(ServiceController::new(ctx)),
        "rolling" => Box::new(RollingController::new(ctx)),
        "swap" => Box::new(SwapController::new(canary, ctx).await?),
        "inplace" => return Err(ControllerError::Unsupported("inplace strategy".to_string())),
        other => {
            debug!(kind = other, "Unknown controller kind, using Deployment controller");
            Box::new(DeploymentController::new(ctx))
        }
    };

    debug!(
        canary = ?canary.name_any(),
        kind = %kind,
        controller = controller.name(),
        "Selected controller"
    );
    Ok(controller)
}

/// The canary's target reference
pub fn target_ref(canary: &Canary) -> Result<WorkloadRef, ControllerError> {
    WorkloadRef::target_of(canary).ok_or_else(|| {
        ControllerError::Configuration(format!(
            "canary {} has no namespace for its target",
            canary.name_any()
        ))
    })
}

/// `sourceRef` when given, `<target>-primary` otherwise
pub fn primary_ref(canary: &Canary) -> Result<WorkloadRef, ControllerError> {
    let target = target_ref(canary)?;
    Ok(match &canary.spec.source_ref {
        Some(source) => WorkloadRef::from_reference(source, &target.namespace),
        None => target.with_name(&format!("{}-primary", target.name)),
    })
}

/// Kind wrapping a Deployment it lists under `status.resources`
pub const PODSPEC_WORKLOAD_KIND: &str = "PodSpecWorkload";

/// Evaluate readiness of a fetched workload
///
/// A PodSpecWorkload publishes no replica counters of its own; it is judged
/// on the Deployment it lists in its status. Until one is listed the verdict
/// is a retriable not-ready.
pub async fn verdict_for(
    ctx: &Context,
    canary: &Canary,
    obj: &DynamicObject,
) -> Result<Verdict, ControllerError> {
    let deadline = canary.progress_deadline_seconds();
    let view = WorkloadView::new(obj);
    if view.kind() != PODSPEC_WORKLOAD_KIND {
        return Ok(readiness::evaluate(obj, deadline, ctx.clock.now()));
    }

    let Some(name) = view.status_resource("Deployment") else {
        return Ok(Verdict::NotReady {
            retriable: true,
            reason: format!("Deployment not found for podSpecWorkload {}", view.name()),
        });
    };
    let deployment = WorkloadRef::new("apps/v1", "Deployment", &name, view.namespace());
    debug!(workload = %deployment, owner = view.name(), "Judging podSpecWorkload by its deployment");
    let obj = ctx.accessor.get(&deployment).await?;
    Ok(readiness::evaluate(&obj, deadline, ctx.clock.now()))
}

/// Turn a not-ready verdict into `ControllerError::NotReady`
pub fn require_ready(verdict: Verdict, obj: &DynamicObject) -> Result<(), ControllerError> {
    match verdict {
        Verdict::Ready => Ok(()),
        Verdict::NotReady { retriable, reason } => {
            let view = WorkloadView::new(obj);
            Err(ControllerError::NotReady {
                kind: view.kind().to_string(),
                name: view.name().to_string(),
                namespace: view.namespace().to_string(),
                retriable,
                reason,
            })
        }
    }
}

/// Hash of `spec.template`, or of the whole spec for kinds without one
///
/// The scale-to-zero node selector is stripped first: it is written by the
/// DaemonSet controller itself and does not make a new version.
pub fn spec_hash_of(obj: &DynamicObject) -> Option<String> {
    let spec = WorkloadView::new(obj).spec()?;
    let mut hashed = spec.get("template").unwrap_or(spec).clone();
    strip_scale_to_zero(&mut hashed);
    Some(compute_spec_hash(&hashed))
}

fn strip_scale_to_zero(template: &mut Value) {
    let Some(pod_spec) = template.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    let emptied = match pod_spec.get_mut("nodeSelector").and_then(Value::as_object_mut) {
        Some(selector) => {
            selector.remove(SCALE_TO_ZERO_NODE_SELECTOR);
            selector.is_empty()
        }
        None => false,
    };
    if emptied {
        pod_spec.remove("nodeSelector");
    }
}

/// Selector label from the candidate list plus discovered ports
pub fn workload_metadata(
    ctx: &Context,
    canary: &Canary,
    obj: &DynamicObject,
) -> Result<WorkloadMetadata, ControllerError> {
    let view = WorkloadView::new(obj);
    let labels = view.labels();
    let selector_label = ctx
        .config
        .selector_labels
        .iter()
        .find(|candidate| labels.contains_key(candidate.as_str()))
        .cloned()
        .ok_or_else(|| {
            ControllerError::Configuration(format!(
                "workload {}.{} meta data label must contain one of {:?}",
                view.name(),
                view.namespace(),
                ctx.config.selector_labels
            ))
        })?;

    let ports = if canary.spec.service.port_discovery {
        view.pod_template()
            .map(|template| discover_ports(&template, canary.spec.service.port))
    } else {
        None
    };

    Ok(WorkloadMetadata {
        selector_label: Some(selector_label),
        ports,
    })
}


#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
