mod common;

use common::{config_with, events, normal, request_metrics, with_cpu, ScriptedSampler};
use resilience_core::degradation::{
    service_fn, DegradationController, ServiceHandler, ServicePriority, SystemState,
};
use resilience_core::events::ResilienceEvent;
use resilience_core::ResilienceError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn controller() -> (DegradationController, Arc<ScriptedSampler>) {
    let sampler = Arc::new(ScriptedSampler::default());
    let controller = DegradationController::new(
        config_with(|c| c.degradation.recovery_threshold = 3),
        events(),
        sampler.clone(),
        request_metrics(),
    );
    (controller, sampler)
}

fn handler(label: &'static str) -> Arc<dyn ServiceHandler> {
    Arc::new(service_fn(move |_args| async move { Ok(json!(label)) }))
}

fn register(controller: &DegradationController, name: &str, priority: ServicePriority) {
    controller.register_service(
        name,
        priority,
        handler("primary"),
        Some(handler("fallback")),
    );
}

#[tokio::test]
async fn test_single_spike_does_not_restore_early() {
    let (controller, sampler) = controller();
    register(&controller, "recommendations", ServicePriority::Low);
    register(&controller, "search", ServicePriority::Medium);

    sampler.set(with_cpu(90.0));
    assert_eq!(controller.check().await, SystemState::Overloaded);
    assert_eq!(controller.is_degraded("recommendations"), Some(true));
    assert_eq!(controller.is_degraded("search"), Some(true));

    sampler.set(normal());
    for _ in 0..2 {
        assert_eq!(controller.check().await, SystemState::Overloaded);
    }
    assert_eq!(
        controller.execute_service("search", json!({})).await.unwrap(),
        json!("fallback")
    );

    assert_eq!(controller.check().await, SystemState::Normal);
    assert_eq!(controller.is_degraded("recommendations"), Some(false));
    assert_eq!(
        controller.execute_service("search", json!({})).await.unwrap(),
        json!("primary")
    );
}

#[tokio::test]
async fn test_critical_services_keep_primary_under_critical_load() {
    let (controller, sampler) = controller();
    register(&controller, "payments", ServicePriority::Critical);
    register(&controller, "profile", ServicePriority::High);

    sampler.set(with_cpu(99.0));
    assert_eq!(controller.check().await, SystemState::Critical);
    assert_eq!(controller.is_degraded("payments"), Some(false));
    assert_eq!(controller.is_degraded("profile"), Some(true));
    assert_eq!(
        controller.execute_service("payments", json!({})).await.unwrap(),
        json!("primary")
    );

    let snapshot = controller.system_state();
    assert_eq!(snapshot.state, SystemState::Critical);
    assert_eq!(snapshot.degraded_services, vec!["profile".to_string()]);
}

#[tokio::test]
async fn test_manual_override_outlives_recovery() {
    let (controller, _sampler) = controller();
    register(&controller, "digest", ServicePriority::High);

    controller.degrade_service("digest").unwrap();
    controller.observe(&with_cpu(99.0));
    for _ in 0..3 {
        controller.observe(&normal());
    }
    assert_eq!(controller.current_state(), SystemState::Normal);
    assert_eq!(controller.is_degraded("digest"), Some(true));

    controller.restore_service("digest").unwrap();
    assert_eq!(controller.is_degraded("digest"), Some(false));
}

#[tokio::test]
async fn test_degraded_service_without_fallback_is_unavailable() {
    let (controller, _sampler) = controller();
    controller.register_service("export", ServicePriority::Low, handler("primary"), None);
    controller.observe(&with_cpu(75.0));

    let err = controller
        .execute_service("export", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::ServiceUnavailable(_)));

    let err = controller
        .execute_service("missing", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::ServiceNotFound(_)));
}

#[tokio::test]
async fn test_background_loop_publishes_transitions() {
    let sampler = Arc::new(ScriptedSampler::default());
    let publisher = events();
    let mut rx = publisher.subscribe();
    let controller = DegradationController::new(
        config_with(|_| {}),
        publisher,
        sampler.clone(),
        request_metrics(),
    );
    sampler.set(with_cpu(90.0));
    controller.start();

    let transition = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let ResilienceEvent::StateTransition { from, to } = rx.recv().await.unwrap().event {
                return (from, to);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(transition, (SystemState::Normal, SystemState::Overloaded));
    controller.close().await;
}
