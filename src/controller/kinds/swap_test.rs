#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::*;
use crate::controller::accessor::fake::Call;
use crate::controller::fixtures::{self, NAMESPACE};
use crate::controller::kinds::testing::{harness, Harness};
use crate::controller::workload::WorkloadMutation;
use serde_json::json;

fn labels() -> serde_json::Value {
    json!({"app": "podinfo", "app.oam.dev/component": "podinfo"})
}

fn swap_canary() -> Canary {
    let mut canary = fixtures::canary("Deployment", "podinfo-v2");
    canary.spec.strategy = Some("swap".to_string());
    canary.spec.service.port_discovery = true;
    canary
}

fn setup(canary: &Canary) -> Harness {
    let h = harness(canary);
    h.accessor
        .insert(fixtures::ready_workload("Deployment", "podinfo-v2", 3, labels()));
    h.accessor
        .insert(fixtures::ready_workload("Deployment", "podinfo-v1", 3, labels()));
    h.accessor
        .add_revision(fixtures::revision("podinfo-v2", 2, "podinfo", json!({})));
    h.accessor
        .add_revision(fixtures::revision("podinfo-v1", 1, "podinfo", json!({})));
    h
}

#[tokio::test]
async fn test_construction_resolves_source_and_target() {
    let canary = swap_canary();
    let h = setup(&canary);

    let controller = SwapController::new(&canary, h.ctx.clone()).await.unwrap();
    assert_eq!(controller.source().name, "podinfo-v1");
}

#[tokio::test]
async fn test_construction_fails_without_baseline() {
    let canary = swap_canary();
    let h = harness(&canary);
    h.accessor
        .insert(fixtures::ready_workload("Deployment", "podinfo-v2", 3, labels()));

    let err = SwapController::new(&canary, h.ctx.clone()).await.err().unwrap();
    assert!(matches!(err, ControllerError::SourceNotFound(_)));
}

#[tokio::test]
async fn test_cold_start_scales_target_down_then_source_up() {
    let mut canary = swap_canary();
    let h = setup(&canary);
    let controller = SwapController::new(&canary, h.ctx.clone()).await.unwrap();

    controller.initialize(&mut canary).await.unwrap();

    assert_eq!(
        h.accessor.calls(),
        vec![
            Call::Patch("podinfo-v2".to_string(), WorkloadMutation::Replicas(0)),
            Call::Patch("podinfo-v1".to_string(), WorkloadMutation::Replicas(7)),
        ]
    );
}

#[tokio::test]
async fn test_initialize_twice_does_not_cold_start_again() {
    let canary = swap_canary();
    let h = setup(&canary);
    let controller = SwapController::new(&canary, h.ctx.clone()).await.unwrap();

    let mut canary = fixtures::with_phase(canary, CanaryPhase::Initialized);
    controller.initialize(&mut canary).await.unwrap();
    controller.initialize(&mut canary).await.unwrap();

    assert!(h.accessor.calls().is_empty());
}

#[tokio::test]
async fn test_unready_baseline_blocks_cold_start() {
    let mut canary = swap_canary();
    let h = setup(&canary);
    let controller = SwapController::new(&canary, h.ctx.clone()).await.unwrap();
    h.accessor
        .insert(fixtures::progressing_workload("Deployment", "podinfo-v1", labels()));

    let err = controller.initialize(&mut canary).await.unwrap_err();
    assert!(err.is_retriable());
    assert!(h.accessor.calls().is_empty());
}

#[tokio::test]
async fn test_scale_to_zero_promote_versus_rollback() {
    let canary = swap_canary();
    let h = setup(&canary);
    let controller = SwapController::new(&canary, h.ctx.clone()).await.unwrap();

    let promoted = fixtures::with_phase(canary.clone(), CanaryPhase::Finalising);
    controller.scale_to_zero(&promoted).await.unwrap();
    assert_eq!(h.accessor.replicas_of("podinfo-v1"), Some(0));

    let failed = fixtures::with_phase(canary, CanaryPhase::Failed);
    controller.scale_to_zero(&failed).await.unwrap();
    assert_eq!(h.accessor.replicas_of("podinfo-v1"), Some(7));
    assert_eq!(h.accessor.replicas_of("podinfo-v2"), None);
}

#[tokio::test]
async fn test_target_changed_only_while_initialized() {
    let canary = swap_canary();
    let h = setup(&canary);
    let controller = SwapController::new(&canary, h.ctx.clone()).await.unwrap();

    for (phase, expected) in [
        (CanaryPhase::Initializing, false),
        (CanaryPhase::Initialized, true),
        (CanaryPhase::Progressing, false),
        (CanaryPhase::Succeeded, false),
    ] {
        let canary = fixtures::with_phase(canary.clone(), phase);
        assert_eq!(
            controller.has_target_changed(&canary).await.unwrap(),
            expected,
            "phase {:?}",
            phase
        );
    }
}

#[tokio::test]
async fn test_metadata_discovers_extra_ports() {
    let canary = swap_canary();
    let h = setup(&canary);
    let controller = SwapController::new(&canary, h.ctx.clone()).await.unwrap();

    let metadata = controller.get_metadata(&canary).await.unwrap();
    assert_eq!(metadata.selector_label.as_deref(), Some("app"));
    let ports = metadata.ports.unwrap();
    assert_eq!(ports.get("http-metrics"), Some(&9797));
    assert!(!ports.contains_key("http"));
}

#[tokio::test]
async fn test_promote_sets_full_weight_once() {
    let canary = swap_canary();
    let h = setup(&canary);
    let controller = SwapController::new(&canary, h.ctx.clone()).await.unwrap();
    let mut canary = fixtures::with_weight(canary, 50);
    h.store.put(canary.clone());

    controller.promote(&mut canary).await.unwrap();
    assert_eq!(canary.canary_weight(), 100);
    assert_eq!(h.store.status_of(NAMESPACE, "podinfo").canary_weight, 100);

    controller.promote(&mut canary).await.unwrap();
    assert_eq!(h.store.writes().len(), 1);
}

#[tokio::test]
async fn test_finalize_restores_source() {
    let canary = swap_canary();
    let h = setup(&canary);
    let controller = SwapController::new(&canary, h.ctx.clone()).await.unwrap();

    controller.finalize(&canary).await.unwrap();
    assert_eq!(h.accessor.replicas_of("podinfo-v1"), Some(7));
}
