//! `ContainerLifecycle`: the orchestrator. Composes every other component
//! into the `Up`/`Start`/`Stop`/`Restart`/`Remove`/`Status`/`Logs`/`Attach`
//! operations and owns the top-level state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::gateway::{CreateContainerSpec, DockerGateway};
use crate::health::HealthChecker;
use crate::image::ImageResolver;
use crate::port_registry::PortRegistry;
use crate::remediate::Remediator;
use crate::types::{
    ContainerConfig, ContainerId, ContainerPhase, ContainerState, HealthCheckResult, HealthLevel, HealthStatus,
    Progress,
};

const UP_DEADLINE: Duration = Duration::from_secs(60);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);
const LABEL_CONFIG_SOURCE: &str = "iris-devtester.config.source";
const LABEL_EDITION: &str = "iris-devtester.config.edition";
const LABEL_VERSION: &str = "iris-devtester.version";
const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A cooperative cancellation signal, checked at every suspension point an
/// operation passes through (spec §5: "the only points at which cancellation
/// is observed"). Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancellationToken {
    /// A token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether [`Self::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolve once this token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Outcome of a lifecycle-owning operation that succeeded without needing to
/// do anything (the idempotent paths of `Up`/`Start`/`Stop`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// `Up` found the container already running and healthy.
    AlreadyRunning,
    /// The operation performed its effect and the container is now running and healthy.
    Started,
    /// The operation performed its effect and the container is now stopped.
    Stopped,
    /// The operation performed its effect and the container no longer exists.
    Removed,
}

/// Rendered JSON-ready status view (spec §6's `Status` contract).
#[derive(Debug, Clone)]
pub struct StatusView {
    /// Observed container state.
    pub state: ContainerState,
    /// Most recent health verdict, `None` if the container is not running.
    pub health: Option<HealthCheckResult>,
}

/// A handle produced by `Attach`. Exposes read/exec/remediate operations but
/// has no reference to `PortRegistry`, so lifecycle-owning operations
/// (`Stop`/`Remove`/`Restart`) are unavailable at the type level; the one
/// remaining runtime check lives in [`ContainerLifecycle::stop`] and friends
/// for UI layers that hold a type-erased handle.
pub struct AttachedHandle {
    container_id: ContainerId,
    container_name: String,
    gateway: Arc<dyn DockerGateway>,
    health: Arc<HealthChecker>,
}

impl AttachedHandle {
    /// The attached container's name.
    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Run a health probe against the attached container.
    pub async fn validate(&self, level: HealthLevel) -> EngineResult<HealthCheckResult> {
        self.health.validate(&self.container_name, level).await
    }

    /// Execute a command inside the attached container.
    pub async fn exec(&self, argv: &[String], stdin: Option<&[u8]>) -> EngineResult<crate::gateway::ExecOutcome> {
        self.gateway.exec_in_container(&self.container_id, argv, stdin).await
    }

    /// Always fails: an attached handle does not own the container's lifecycle.
    pub fn stop(&self) -> EngineResult<()> {
        Err(EngineError::AttachedHandle {
            name: self.container_name.clone(),
        })
    }

    /// Always fails, see [`Self::stop`].
    pub fn remove(&self) -> EngineResult<()> {
        Err(EngineError::AttachedHandle {
            name: self.container_name.clone(),
        })
    }

    /// Always fails, see [`Self::stop`].
    pub fn restart(&self) -> EngineResult<()> {
        Err(EngineError::AttachedHandle {
            name: self.container_name.clone(),
        })
    }
}

/// The orchestrator. Holds no persistent state of its own beyond the handles
/// it composes.
pub struct ContainerLifecycle {
    gateway: Arc<dyn DockerGateway>,
    images: ImageResolver,
    ports: PortRegistry,
    health: Arc<HealthChecker>,
    remediator: Remediator,
}

impl ContainerLifecycle {
    /// Build a lifecycle over the given components, pinging the gateway once
    /// so `EngineUnavailable` surfaces here instead of three steps into `Up`.
    pub async fn new(
        gateway: Arc<dyn DockerGateway>,
        ports: PortRegistry,
    ) -> EngineResult<Self> {
        gateway.ping().await?;
        Ok(Self {
            gateway: gateway.clone(),
            images: ImageResolver::new(),
            ports,
            health: Arc::new(HealthChecker::new(gateway.clone())),
            remediator: Remediator::new(gateway),
        })
    }

    fn emit(progress: &mpsc::UnboundedSender<Progress>, event: Progress) {
        let _ = progress.send(event);
    }

    /// Borrow the port registry this lifecycle was built with, for callers
    /// that need direct access to `ports.list`/`ports.clear`/`ports.inspect`
    /// (spec §6's UI-facing port operations).
    #[must_use]
    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    /// Idempotent create-or-reconcile. See spec §4.6 for the exact state
    /// machine; this follows it step for step.
    pub async fn up(
        &self,
        config: &ContainerConfig,
        project_path: &std::path::Path,
        progress: mpsc::UnboundedSender<Progress>,
        cancel: CancellationToken,
    ) -> EngineResult<OperationOutcome> {
        config.validate()?;
        Self::emit(&progress, Progress::Step {
            message: format!("validating configuration for {}", config.container_name),
        });

        let existing = self.gateway.inspect_container(&config.container_name).await?;
        match existing.phase {
            ContainerPhase::Running => {
                let result = self.health.validate(&config.container_name, HealthLevel::Full).await?;
                if result.is_healthy() {
                    Self::emit(&progress, Progress::Success {
                        message: format!("{} is already running and healthy", config.container_name),
                    });
                    return Ok(OperationOutcome::AlreadyRunning);
                }
                return Err(EngineError::UnhealthyExistingContainer {
                    name: config.container_name.clone(),
                    detail: result.detail.unwrap_or_default(),
                });
            }
            ContainerPhase::Stopped => {
                return self.start_existing(&config.container_name, &progress, cancel).await;
            }
            _ => {}
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                message: "up cancelled before create".to_string(),
            });
        }

        let preferred = config.has_non_default_primary_port().then_some(config.primary_port);
        Self::emit(&progress, Progress::SubStep {
            message: "reserving a port".to_string(),
        });
        let assignment = self.ports.assign(project_path, preferred).await?;

        let image = self.images.resolve(config.edition, &config.image_tag);
        Self::emit(&progress, Progress::SubStep {
            message: format!("pulling image {image}"),
        });
        if let Err(e) = self.gateway.pull_image(&image).await {
            self.ports.release(project_path).await.ok();
            return Err(e);
        }

        let mut labels = HashMap::new();
        labels.insert(
            LABEL_CONFIG_SOURCE.to_string(),
            config
                .config_source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "default".to_string()),
        );
        labels.insert(LABEL_EDITION.to_string(), config.edition.to_string());
        labels.insert(LABEL_VERSION.to_string(), ENGINE_VERSION.to_string());

        let mut env = HashMap::new();
        env.insert("IRIS_PASSWORD".to_string(), config.password.clone());
        env.insert("IRIS_NAMESPACE".to_string(), config.namespace.clone());
        if let Some(license) = &config.license_key {
            env.insert("ISC_CPF_MERGE_KEY".to_string(), license.clone());
        }

        let spec = CreateContainerSpec {
            image,
            name: config.container_name.clone(),
            env,
            port_bindings: vec![(assignment.port, config.primary_port), (config.web_port, config.web_port)],
            volumes: config.volumes.clone(),
            labels,
        };

        Self::emit(&progress, Progress::Step {
            message: format!("creating container {}", config.container_name),
        });
        let container_id = match self.gateway.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.ports.release(project_path).await.ok();
                return Err(e);
            }
        };
        self.ports.record_container_name(project_path, &config.container_name).await?;

        if cancel.is_cancelled() {
            self.rollback(&container_id, project_path).await;
            return Err(EngineError::Cancelled {
                message: "up cancelled after create".to_string(),
            });
        }

        Self::emit(&progress, Progress::Step {
            message: format!("starting container {}", config.container_name),
        });
        if let Err(e) = self.gateway.start_container(&container_id).await {
            self.rollback(&container_id, project_path).await;
            return Err(e);
        }

        match self
            .drive_health_to_full(&config.container_name, config, &progress, cancel.clone())
            .await
        {
            Ok(()) => {
                Self::emit(&progress, Progress::Success {
                    message: format!("{} is healthy on port {}", config.container_name, assignment.port),
                });
                Ok(OperationOutcome::Started)
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    self.rollback(&container_id, project_path).await;
                }
                Err(e)
            }
        }
    }

    async fn rollback(&self, container_id: &ContainerId, project_path: &std::path::Path) {
        warn!(container_id = %container_id, "rolling back partially created container");
        let _ = self.gateway.remove_container(container_id, true, true).await;
        let _ = self.ports.release(project_path).await;
    }

    async fn start_existing(
        &self,
        container_name: &str,
        progress: &mpsc::UnboundedSender<Progress>,
        cancel: CancellationToken,
    ) -> EngineResult<OperationOutcome> {
        let state = self.gateway.inspect_container(container_name).await?;
        if state.phase == ContainerPhase::Running {
            return Ok(OperationOutcome::AlreadyRunning);
        }
        let Some(container_id) = state.container_id.clone() else {
            return Err(EngineError::ContainerNotFound {
                name: container_name.to_string(),
            });
        };
        Self::emit(progress, Progress::Step {
            message: format!("starting {container_name}"),
        });
        self.gateway.start_container(&container_id).await?;
        self.health.invalidate(container_name);

        // Starting an existing container re-runs only the health/remediation
        // arc; reconstructing a full ContainerConfig here would require
        // fields the registry does not keep, so username/password fall back
        // to the platform defaults, matching the defaults `ContainerConfig`
        // itself uses.
        let fallback = ContainerConfig::new(crate::types::Edition::Community);
        self.drive_health_to_full(container_name, &fallback, progress, cancel).await?;
        Ok(OperationOutcome::Started)
    }

    async fn drive_health_to_full(
        &self,
        container_name: &str,
        config: &ContainerConfig,
        progress: &mpsc::UnboundedSender<Progress>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let deadline = tokio::time::Instant::now() + UP_DEADLINE;
        self.health.invalidate(container_name);

        let run_once = || self.health.validate(container_name, HealthLevel::Full);

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(EngineError::Cancelled { message: "up cancelled during health checks".to_string() });
            }
            result = tokio::time::timeout_at(deadline, run_once()) => result,
        };
        let result = match outcome {
            Ok(inner) => inner?,
            Err(_) => {
                return Err(EngineError::DeadlineExceeded {
                    elapsed: UP_DEADLINE,
                    message: format!("{container_name} did not reach full health"),
                });
            }
        };
        if result.is_healthy() {
            Self::emit(progress, Progress::SubStep {
                message: "full health check passed".to_string(),
            });
            return Ok(());
        }

        let detail = result.detail.clone().unwrap_or_default();

        if result.status == HealthStatus::StaleReference {
            return Err(EngineError::StaleReference {
                name: container_name.to_string(),
            });
        }
        if result.status == HealthStatus::EngineError {
            return Err(EngineError::EngineUnavailable { message: detail });
        }

        let Some(container_id) = self
            .gateway
            .inspect_container(container_name)
            .await?
            .container_id
        else {
            return Err(EngineError::HealthTimeout {
                level: HealthLevel::Full.to_string(),
                budget: HealthLevel::Full.budget(),
            });
        };

        if detail.to_lowercase().contains("password") {
            Self::emit(progress, Progress::Warning {
                message: "password appears to require reset, remediating".to_string(),
                cause: Some(detail.clone()),
            });
            self.remediator
                .reset_password(&container_id, &config.username, &config.password)
                .await?;
        } else if result.status == HealthStatus::RunningNotAccessible {
            Self::emit(progress, Progress::Warning {
                message: "privileged service appears disabled, remediating".to_string(),
                cause: Some(detail.clone()),
            });
            self.remediator.enable_privileged_service(&container_id).await?;
        } else {
            return Err(EngineError::HealthTimeout {
                level: result.level.to_string(),
                budget: result.level.budget(),
            });
        }

        self.health.invalidate(container_name);
        let retried = self.health.validate(container_name, HealthLevel::Full).await?;
        if retried.is_healthy() {
            Self::emit(progress, Progress::SubStep {
                message: "full health check passed after remediation".to_string(),
            });
            Ok(())
        } else {
            Err(EngineError::UnhealthyExistingContainer {
                name: container_name.to_string(),
                detail: retried.detail.unwrap_or_default(),
            })
        }
    }

    /// Start an existing stopped container, or fall back to `Up` if nothing
    /// exists and a config was supplied.
    pub async fn start(
        &self,
        container_name: &str,
        config: Option<&ContainerConfig>,
        project_path: &std::path::Path,
        progress: mpsc::UnboundedSender<Progress>,
        cancel: CancellationToken,
    ) -> EngineResult<OperationOutcome> {
        let state = self.gateway.inspect_container(container_name).await?;
        match state.phase {
            ContainerPhase::Absent => match config {
                Some(config) => self.up(config, project_path, progress, cancel).await,
                None => Err(EngineError::ContainerNotFound {
                    name: container_name.to_string(),
                }),
            },
            _ => self.start_existing(container_name, &progress, cancel).await,
        }
    }

    /// Idempotent stop. Does not release the port assignment.
    pub async fn stop(&self, container_name: &str, grace: Option<Duration>) -> EngineResult<OperationOutcome> {
        let state = self.gateway.inspect_container(container_name).await?;
        if state.phase != ContainerPhase::Running {
            return Ok(OperationOutcome::Stopped);
        }
        let Some(container_id) = state.container_id else {
            return Ok(OperationOutcome::Stopped);
        };
        self.gateway
            .stop_container(&container_id, grace.unwrap_or(DEFAULT_STOP_GRACE))
            .await?;
        self.health.invalidate(container_name);
        Ok(OperationOutcome::Stopped)
    }

    /// `Stop` then `Start`.
    pub async fn restart(
        &self,
        container_name: &str,
        config: Option<&ContainerConfig>,
        project_path: &std::path::Path,
        progress: mpsc::UnboundedSender<Progress>,
        cancel: CancellationToken,
    ) -> EngineResult<OperationOutcome> {
        self.stop(container_name, None).await?;
        self.start(container_name, config, project_path, progress, cancel).await
    }

    /// Remove a container. Fails with `ContainerRunning` unless `force`.
    /// On success, releases the port assignment regardless of `remove_volumes`.
    pub async fn remove(
        &self,
        container_name: &str,
        project_path: &std::path::Path,
        force: bool,
        remove_volumes: bool,
    ) -> EngineResult<OperationOutcome> {
        let state = self.gateway.inspect_container(container_name).await?;
        if let Some(container_id) = state.container_id {
            self.gateway.remove_container(&container_id, force, remove_volumes).await?;
        }
        self.health.invalidate(container_name);
        self.ports.release(project_path).await?;
        Ok(OperationOutcome::Removed)
    }

    /// Read-only status: observed state plus the most recent health verdict.
    pub async fn status(&self, container_name: &str) -> EngineResult<StatusView> {
        let state = self.gateway.inspect_container(container_name).await?;
        let health = if state.phase == ContainerPhase::Running {
            Some(self.health.validate(container_name, HealthLevel::Minimal).await?)
        } else {
            None
        };
        Ok(StatusView { state, health })
    }

    /// Delegate to `DockerGateway::stream_logs`.
    pub async fn logs(
        &self,
        container_name: &str,
        tail_lines: Option<usize>,
        follow: bool,
    ) -> EngineResult<mpsc::Receiver<String>> {
        let state = self.gateway.inspect_container(container_name).await?;
        let Some(container_id) = state.container_id else {
            return Err(EngineError::ContainerNotFound {
                name: container_name.to_string(),
            });
        };
        self.gateway.stream_logs(&container_id, tail_lines, follow).await
    }

    /// Attach to a container this process did not create.
    pub async fn attach(&self, container_name: &str) -> EngineResult<AttachedHandle> {
        let result = self.health.validate(container_name, HealthLevel::Standard).await?;
        if !result.is_healthy() {
            return Err(EngineError::UnhealthyExistingContainer {
                name: container_name.to_string(),
                detail: result.detail.unwrap_or_default(),
            });
        }
        let state = self.gateway.inspect_container(container_name).await?;
        let Some(container_id) = state.container_id else {
            return Err(EngineError::ContainerNotFound {
                name: container_name.to_string(),
            });
        };
        info!(container = %container_name, "attached");
        Ok(AttachedHandle {
            container_id,
            container_name: container_name.to_string(),
            gateway: self.gateway.clone(),
            health: self.health.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockDockerGateway;
    use crate::port_registry::{PortRegistry, PortRegistryConfig};
    use crate::types::Edition;

    fn lifecycle_components(dir: &std::path::Path) -> (Arc<MockDockerGateway>, PortRegistry) {
        let gateway = Arc::new(MockDockerGateway::new());
        let config = PortRegistryConfig::default_for_home(dir);
        let ports = PortRegistry::new(config, gateway.clone(), "iris_".to_string());
        (gateway, ports)
    }

    #[tokio::test]
    async fn up_creates_starts_and_reports_healthy() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let (gateway, ports) = lifecycle_components(home.path());
        let lifecycle = ContainerLifecycle::new(gateway, ports).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ContainerConfig::new(Edition::Community);
        let outcome = lifecycle
            .up(&config, project.path(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, OperationOutcome::Started);
    }

    #[tokio::test]
    async fn up_twice_is_idempotent() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let (gateway, ports) = lifecycle_components(home.path());
        let lifecycle = ContainerLifecycle::new(gateway, ports).await.unwrap();
        let config = ContainerConfig::new(Edition::Community);

        let (tx1, _rx1) = mpsc::unbounded_channel();
        lifecycle.up(&config, project.path(), tx1, CancellationToken::new()).await.unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let second = lifecycle
            .up(&config, project.path(), tx2, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second, OperationOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn stop_keeps_the_port_assignment_active() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let (gateway, ports) = lifecycle_components(home.path());
        let lifecycle = ContainerLifecycle::new(gateway, ports).await.unwrap();
        let config = ContainerConfig::new(Edition::Community);
        let (tx, _rx) = mpsc::unbounded_channel();
        lifecycle.up(&config, project.path(), tx, CancellationToken::new()).await.unwrap();

        lifecycle.stop(&config.container_name, None).await.unwrap();
        let assignment = lifecycle.ports.get(project.path()).await.unwrap().unwrap();
        assert_eq!(assignment.status, crate::types::AssignmentStatus::Active);
    }

    #[tokio::test]
    async fn remove_releases_the_port() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let (gateway, ports) = lifecycle_components(home.path());
        let lifecycle = ContainerLifecycle::new(gateway, ports).await.unwrap();
        let config = ContainerConfig::new(Edition::Community);
        let (tx, _rx) = mpsc::unbounded_channel();
        lifecycle.up(&config, project.path(), tx, CancellationToken::new()).await.unwrap();

        lifecycle
            .remove(&config.container_name, project.path(), true, false)
            .await
            .unwrap();
        assert!(lifecycle.ports.get(project.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attached_handle_refuses_lifecycle_ops() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let (gateway, ports) = lifecycle_components(home.path());
        let lifecycle = ContainerLifecycle::new(gateway, ports).await.unwrap();
        let config = ContainerConfig::new(Edition::Community);
        let (tx, _rx) = mpsc::unbounded_channel();
        lifecycle.up(&config, project.path(), tx, CancellationToken::new()).await.unwrap();

        let handle = lifecycle.attach(&config.container_name).await.unwrap();
        assert!(matches!(handle.stop(), Err(EngineError::AttachedHandle { .. })));
    }
}
