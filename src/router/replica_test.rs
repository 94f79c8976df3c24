#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::*;
use crate::controller::accessor::fake::Call;
use crate::controller::fixtures;
use crate::controller::kinds::testing::{harness, Harness};
use crate::controller::kinds::{CanaryController, ControllerError, DeploymentController};
use crate::controller::workload::WorkloadRef;
use crate::controller::workload::WorkloadMutation;
use crate::crd::canary::{CanaryPhase, CanaryStatus};
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Inner router recording every split it is asked to apply
#[derive(Default)]
struct RecordingRouter {
    routes: Mutex<Vec<(i32, i32, bool)>>,
}

impl RecordingRouter {
    fn last(&self) -> Option<(i32, i32, bool)> {
        self.routes.lock().unwrap().last().copied()
    }
}

#[async_trait]
impl MeshRouter for RecordingRouter {
    async fn reconcile(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }

    async fn set_routes(
        &self,
        _canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<(), RouterError> {
        self.routes
            .lock()
            .unwrap()
            .push((primary_weight, canary_weight, mirrored));
        Ok(())
    }

    async fn get_routes(&self, _canary: &Canary) -> Result<RouteWeights, RouterError> {
        Ok(match self.last() {
            Some((primary, canary, mirrored)) => RouteWeights {
                primary,
                canary,
                mirrored,
            },
            None => RouteWeights::PRIMARY_ONLY,
        })
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

fn setup(canary: &Canary) -> (Harness, DeploymentController) {
    let h = harness(canary);
    for name in ["podinfo", "podinfo-primary"] {
        h.accessor.insert(fixtures::ready_workload(
            "Deployment",
            name,
            2,
            json!({"app": name}),
        ));
    }
    let controller = DeploymentController::new(h.ctx.clone());
    (h, controller)
}

#[test]
fn test_replica_split_tracks_weight() {
    let expected_canary = [1, 2, 3, 3, 4, 5, 5, 6, 7, 7];
    for (i, expected) in expected_canary.iter().enumerate() {
        let weight = (i as i32 + 1) * 10;
        let (primary, canary) = compute_replica_split(weight, 7, 0);
        assert_eq!(canary, *expected, "weight {}", weight);
        if weight == 100 {
            assert_eq!(primary, 0);
        } else {
            assert_eq!(primary, (7 - canary).max(1), "weight {}", weight);
        }
    }
}

#[test]
fn test_replica_split_floors() {
    // a canary receiving traffic always has a replica
    assert_eq!(compute_replica_split(1, 7, 0), (6, 1));
    assert_eq!(compute_replica_split(5, 1, 0), (1, 1));
    // no traffic, no canary replicas
    assert_eq!(compute_replica_split(0, 7, 0), (7, 0));
    // primary is never drained before full promotion, never negative
    assert_eq!(compute_replica_split(99, 1, 0), (1, 1));
    assert_eq!(compute_replica_split(100, 3, 5), (0, 5));
}

#[test]
fn test_replica_override_wins() {
    assert_eq!(compute_replica_split(10, 7, 3), (4, 3));
    assert_eq!(compute_replica_split(90, 7, 2), (5, 2));
}

#[tokio::test]
async fn test_step_applies_weights_then_scales_canary_before_primary() {
    let canary = fixtures::with_phase(
        fixtures::canary("Deployment", "podinfo"),
        CanaryPhase::Progressing,
    );
    let (h, controller) = setup(&canary);
    let inner = RecordingRouter::default();
    let router = ReplicaRouter::new(&inner, controller.scaler());

    router.set_routes(&canary, 70, 30, true).await.unwrap();

    assert_eq!(inner.last(), Some((70, 30, true)));
    assert_eq!(
        h.accessor.calls(),
        vec![
            Call::Patch("podinfo".to_string(), WorkloadMutation::Replicas(3)),
            Call::Patch("podinfo-primary".to_string(), WorkloadMutation::Replicas(4)),
        ]
    );
    assert_eq!(
        router.get_routes(&canary).await.unwrap(),
        RouteWeights {
            primary: 70,
            canary: 30,
            mirrored: true
        }
    );
}

#[tokio::test]
async fn test_promoted_canary_takes_all_traffic_regardless_of_arguments() {
    for phase in [
        CanaryPhase::Promoting,
        CanaryPhase::Finalising,
        CanaryPhase::Succeeded,
    ] {
        let canary = fixtures::with_phase(fixtures::canary("Deployment", "podinfo"), phase);
        let (h, controller) = setup(&canary);
        let inner = RecordingRouter::default();
        let router = ReplicaRouter::new(&inner, controller.scaler());

        router.set_routes(&canary, 80, 20, true).await.unwrap();

        assert_eq!(inner.last(), Some((0, 100, true)), "phase {:?}", phase);
        assert_eq!(h.accessor.replicas_of("podinfo"), Some(7));
        // the baseline is retired by scale_to_zero, not here
        assert_eq!(h.accessor.replicas_of("podinfo-primary"), None);
    }
}

#[tokio::test]
async fn test_failed_canary_rolls_back_in_one_call() {
    let canary = fixtures::with_phase(
        fixtures::canary("Deployment", "podinfo"),
        CanaryPhase::Failed,
    );
    let (h, controller) = setup(&canary);
    let inner = RecordingRouter::default();
    let router = ReplicaRouter::new(&inner, controller.scaler());

    router.set_routes(&canary, 50, 50, true).await.unwrap();

    assert_eq!(inner.routes.lock().unwrap().len(), 1);
    assert_eq!(inner.last(), Some((100, 0, true)));
    assert_eq!(
        h.accessor.calls(),
        vec![
            Call::Patch("podinfo-primary".to_string(), WorkloadMutation::Replicas(7)),
            Call::Patch("podinfo".to_string(), WorkloadMutation::Replicas(0)),
        ]
    );
}

#[tokio::test]
async fn test_failed_checks_over_threshold_count_as_failed() {
    let mut canary = fixtures::canary("Deployment", "podinfo");
    canary.status = Some(CanaryStatus {
        phase: Some(CanaryPhase::Progressing),
        failed_checks: 5,
        ..Default::default()
    });
    let (h, controller) = setup(&canary);
    let inner = RecordingRouter::default();
    let router = ReplicaRouter::new(&inner, controller.scaler());

    router.set_routes(&canary, 60, 40, false).await.unwrap();

    assert_eq!(inner.last(), Some((100, 0, false)));
    assert_eq!(h.accessor.replicas_of("podinfo"), Some(0));
}

#[tokio::test]
async fn test_scale_failure_reports_workload_and_replicas() {
    fixtures::init_tracing();
    let canary = fixtures::with_phase(
        fixtures::canary("Deployment", "podinfo"),
        CanaryPhase::Progressing,
    );
    let (h, controller) = setup(&canary);
    h.accessor.fail_patches_for("podinfo-primary");
    let inner = RecordingRouter::default();
    let router = ReplicaRouter::new(&inner, controller.scaler());

    let err = router.set_routes(&canary, 90, 10, false).await.unwrap_err();

    match &err {
        RouterError::Scale {
            role,
            name,
            namespace,
            replicas,
            ..
        } => {
            assert_eq!(*role, ScaleTarget::Primary);
            assert_eq!(name, "podinfo-primary");
            assert_eq!(namespace, fixtures::NAMESPACE);
            assert_eq!(*replicas, 6);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.to_string().contains("podinfo-primary.test to 6 replicas"));
    // canary was scaled first and is not undone
    assert_eq!(h.accessor.replicas_of("podinfo"), Some(1));
}

#[tokio::test]
async fn test_coordinator_borrows_only_the_scaler() {
    let canary = fixtures::canary("Deployment", "podinfo");
    let (_h, controller) = setup(&canary);
    let controller: Arc<dyn CanaryController> = Arc::new(controller);
    let inner = RecordingRouter::default();

    {
        let router = ReplicaRouter::new(&inner, controller.scaler());
        router.reconcile(&canary).await.unwrap();
        router.finalize(&canary).await.unwrap();
    }
    assert_eq!(Arc::strong_count(&controller), 1);
}

#[test]
fn test_replica_split_large_replica_counts() {
    assert_eq!(compute_replica_split(100, 30_000_000, 0), (0, 30_000_000));
    assert_eq!(compute_replica_split(50, i32::MAX, 0), (i32::MAX / 2, i32::MAX / 2 + 1));
    assert_eq!(compute_replica_split(1, i32::MAX, 0).1, 21_474_837);
}

/// Scaler whose baseline cannot be resolved
struct UnresolvedScaler;

#[async_trait]
impl Scaler for UnresolvedScaler {
    async fn workload_for(
        &self,
        _canary: &Canary,
        _target: ScaleTarget,
    ) -> Result<WorkloadRef, ControllerError> {
        Err(ControllerError::SourceNotFound(
            "baseline workload not found for component podinfo".to_string(),
        ))
    }

    async fn scale(
        &self,
        canary: &Canary,
        target: ScaleTarget,
        _replicas: i32,
    ) -> Result<(), ControllerError> {
        self.workload_for(canary, target).await.map(|_| ())
    }
}

#[tokio::test]
async fn test_unresolved_workload_error_names_the_role() {
    let canary = fixtures::with_phase(
        fixtures::canary("Deployment", "podinfo"),
        CanaryPhase::Failed,
    );
    let inner = RecordingRouter::default();
    let router = ReplicaRouter::new(&inner, &UnresolvedScaler);

    let err = router.set_routes(&canary, 0, 100, false).await.unwrap_err();
    match err {
        RouterError::Scale { role, name, .. } => {
            assert_eq!(role, ScaleTarget::Primary);
            assert_eq!(name, "podinfo-primary");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let promoted = fixtures::with_phase(canary, CanaryPhase::Succeeded);
    let err = router.set_routes(&promoted, 0, 100, false).await.unwrap_err();
    match err {
        RouterError::Scale { role, name, .. } => {
            assert_eq!(role, ScaleTarget::Canary);
            assert_eq!(name, "podinfo");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
