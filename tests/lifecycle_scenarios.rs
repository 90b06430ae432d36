//! End-to-end scenarios against the in-memory gateway, covering the
//! concrete cases a real Docker-backed integration suite seeds from.

use std::sync::Arc;

use iris_devtester_engine::gateway::MockDockerGateway;
use iris_devtester_engine::lifecycle::{CancellationToken, ContainerLifecycle, OperationOutcome};
use iris_devtester_engine::port_registry::{PortRegistry, PortRegistryConfig};
use iris_devtester_engine::types::{ContainerConfig, Edition};

fn registry_for(home: &std::path::Path, gateway: Arc<MockDockerGateway>) -> PortRegistry {
    PortRegistry::new(PortRegistryConfig::default_for_home(home), gateway, "iris_")
}

fn community_config(name: &str) -> ContainerConfig {
    let mut config = ContainerConfig::new(Edition::Community);
    config.container_name = name.to_string();
    config
}

#[tokio::test]
async fn two_projects_get_unique_ports() {
    let home = tempfile::tempdir().unwrap();
    let gateway = Arc::new(MockDockerGateway::new());
    let registry = registry_for(home.path(), gateway.clone());
    let lifecycle = ContainerLifecycle::new(gateway, registry).await.unwrap();

    let project_a = tempfile::tempdir().unwrap();
    let project_b = tempfile::tempdir().unwrap();
    let (tx_a, _rx_a) = tokio::sync::mpsc::unbounded_channel();
    let (tx_b, _rx_b) = tokio::sync::mpsc::unbounded_channel();

    let outcome_a = lifecycle
        .up(&community_config("iris_a"), project_a.path(), tx_a, CancellationToken::new())
        .await
        .unwrap();
    let outcome_b = lifecycle
        .up(&community_config("iris_b"), project_b.path(), tx_b, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome_a, OperationOutcome::Started);
    assert_eq!(outcome_b, OperationOutcome::Started);

    let port_a = lifecycle.status("iris_a").await.unwrap().state.ports.values().next().copied();
    let port_b = lifecycle.status("iris_b").await.unwrap().state.ports.values().next().copied();
    assert_ne!(port_a, port_b);
}

#[tokio::test]
async fn port_is_stable_across_a_stop_start_cycle() {
    let home = tempfile::tempdir().unwrap();
    let gateway = Arc::new(MockDockerGateway::new());
    let registry = registry_for(home.path(), gateway.clone());
    let lifecycle = ContainerLifecycle::new(gateway, registry).await.unwrap();
    let project = tempfile::tempdir().unwrap();
    let config = community_config("iris_stable");

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    lifecycle.up(&config, project.path(), tx, CancellationToken::new()).await.unwrap();
    let before = lifecycle.status("iris_stable").await.unwrap().state.ports.values().next().copied().unwrap();

    lifecycle.stop("iris_stable", None).await.unwrap();

    let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
    lifecycle.start("iris_stable", Some(&config), project.path(), tx2, CancellationToken::new()).await.unwrap();
    let after = lifecycle.status("iris_stable").await.unwrap().state.ports.values().next().copied().unwrap();

    assert_eq!(before, after);
    let assignments = lifecycle.ports().list().await.unwrap();
    assert_eq!(assignments.iter().filter(|a| a.status == iris_devtester_engine::types::AssignmentStatus::Active).count(), 1);
}

#[tokio::test]
async fn stale_cleanup_evicts_a_record_whose_container_vanished_out_of_band() {
    let home = tempfile::tempdir().unwrap();
    let gateway = Arc::new(MockDockerGateway::new());
    let registry = registry_for(home.path(), gateway.clone());
    let lifecycle = ContainerLifecycle::new(gateway.clone(), registry).await.unwrap();
    let project = tempfile::tempdir().unwrap();
    let config = community_config("iris_b");

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    lifecycle.up(&config, project.path(), tx, CancellationToken::new()).await.unwrap();

    gateway.remove_out_of_band("iris_b");

    let evicted = lifecycle.ports().cleanup_stale().await.unwrap();
    assert_eq!(evicted.len(), 1);
    assert!(lifecycle.ports().get(project.path()).await.unwrap().is_none());
}

#[tokio::test]
async fn conflicting_preferred_ports_name_the_first_project_in_the_diagnostic() {
    let home = tempfile::tempdir().unwrap();
    let gateway = Arc::new(MockDockerGateway::new());
    let registry = registry_for(home.path(), gateway.clone());
    let lifecycle = ContainerLifecycle::new(gateway, registry).await.unwrap();

    let project_a = tempfile::tempdir().unwrap();
    let project_b = tempfile::tempdir().unwrap();
    let mut config_a = community_config("iris_a");
    config_a.primary_port = 19999;
    let mut config_b = community_config("iris_b");
    config_b.primary_port = 19999;

    let (tx_a, _rx_a) = tokio::sync::mpsc::unbounded_channel();
    lifecycle.up(&config_a, project_a.path(), tx_a, CancellationToken::new()).await.unwrap();

    let (tx_b, _rx_b) = tokio::sync::mpsc::unbounded_channel();
    let err = lifecycle
        .up(&config_b, project_b.path(), tx_b, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, iris_devtester_engine::errors::EngineError::PortConflict { port: 19999, .. }));

    let status = lifecycle.status("iris_a").await.unwrap();
    assert_eq!(status.state.phase, iris_devtester_engine::types::ContainerPhase::Running);
}

#[tokio::test]
async fn remove_without_force_on_a_running_container_fails_and_keeps_the_port() {
    let home = tempfile::tempdir().unwrap();
    let gateway = Arc::new(MockDockerGateway::new());
    let registry = registry_for(home.path(), gateway.clone());
    let lifecycle = ContainerLifecycle::new(gateway, registry).await.unwrap();
    let project = tempfile::tempdir().unwrap();
    let config = community_config("iris_running");

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    lifecycle.up(&config, project.path(), tx, CancellationToken::new()).await.unwrap();

    let err = lifecycle.remove("iris_running", project.path(), false, false).await.unwrap_err();
    assert!(matches!(err, iris_devtester_engine::errors::EngineError::ContainerRunning { .. }));
    assert!(lifecycle.ports().get(project.path()).await.unwrap().is_some());

    lifecycle.remove("iris_running", project.path(), true, false).await.unwrap();
    assert!(lifecycle.ports().get(project.path()).await.unwrap().is_none());
}
