//! Cross-process port-arbitration service.
//!
//! Persists port-to-project assignments in a user-scoped JSON file, guards
//! every mutation with an OS-level file lock, and reconciles against Docker
//! to evict assignments whose container no longer exists.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};
use crate::gateway::DockerGateway;
use crate::types::{normalize_project_path, AssignmentKind, AssignmentStatus, PortAssignment, PortRegistryFile};

/// How long `Assign`/`Release`/etc wait to acquire the file lock before
/// failing with `LockTimeout`.
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The contiguous interval of host ports auto-assignments are drawn from.
#[derive(Debug, Clone)]
pub struct PortRegistryConfig {
    /// Path of the JSON registry file.
    pub registry_path: PathBuf,
    /// Inclusive low/high bounds of the managed range.
    pub managed_range: RangeInclusive<u16>,
}

impl PortRegistryConfig {
    /// Default location under the user's home directory and the spec's
    /// default managed range, 1972-1981.
    #[must_use]
    pub fn default_for_home(home: &Path) -> Self {
        Self {
            registry_path: home.join(".iris-devtester").join("port-registry.json"),
            managed_range: 1972..=1981,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.registry_path.with_extension("lock")
    }
}

/// Coordinates host-port assignment across concurrent processes.
pub struct PortRegistry {
    config: PortRegistryConfig,
    gateway: Arc<dyn DockerGateway>,
    name_prefix: String,
}

impl PortRegistry {
    /// Build a registry against the given config and gateway. `name_prefix`
    /// is the tool's container-naming convention, used when reconciling
    /// assignments against Docker's live container list.
    #[must_use]
    pub fn new(config: PortRegistryConfig, gateway: Arc<dyn DockerGateway>, name_prefix: impl Into<String>) -> Self {
        Self {
            config,
            gateway,
            name_prefix: name_prefix.into(),
        }
    }

    fn acquire_lock(&self) -> EngineResult<(std::fs::File, PathBuf)> {
        let lock_path = self.config.lock_path();
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok((file, lock_path)),
                Err(_) if start.elapsed() < LOCK_ACQUIRE_TIMEOUT => {
                    warn!(lock_path = %lock_path.display(), "waiting for port registry lock");
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(_) => {
                    return Err(EngineError::LockTimeout {
                        lock_path: lock_path.display().to_string(),
                        timeout: LOCK_ACQUIRE_TIMEOUT,
                    })
                }
            }
        }
    }

    fn load(&self) -> EngineResult<PortRegistryFile> {
        if !self.config.registry_path.exists() {
            return Ok(PortRegistryFile::new(chrono::Utc::now()));
        }
        let raw = std::fs::read_to_string(&self.config.registry_path)?;
        let file: PortRegistryFile = serde_json::from_str(&raw).map_err(|e| EngineError::RegistryCorrupted {
            path: self.config.registry_path.display().to_string(),
            reason: e.to_string(),
        })?;
        if file.schema_version != PortRegistryFile::CURRENT_SCHEMA_VERSION {
            return Err(EngineError::RegistryCorrupted {
                path: self.config.registry_path.display().to_string(),
                reason: format!(
                    "unsupported schemaVersion '{}', expected '{}'",
                    file.schema_version,
                    PortRegistryFile::CURRENT_SCHEMA_VERSION
                ),
            });
        }
        Ok(file)
    }

    fn write_atomic(&self, file: &PortRegistryFile) -> EngineResult<()> {
        let parent = self
            .config
            .registry_path
            .parent()
            .expect("registry path has a parent");
        std::fs::create_dir_all(parent)?;
        let tmp_path = parent.join(format!(".port-registry-{}.tmp", std::process::id()));
        let contents = serde_json::to_string_pretty(file)?;
        std::fs::write(&tmp_path, &contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp_path, &self.config.registry_path)?;
        Ok(())
    }

    /// Assign a port to `project_path`, idempotently. See the module-level
    /// docs and the spec's §4.3 for the exact decision sequence.
    pub async fn assign(&self, project_path: &Path, preferred: Option<u16>) -> EngineResult<PortAssignment> {
        let project_path = normalize_project_path(project_path)?;
        let (_lock, _lock_path) = self.acquire_lock()?;
        let mut file = self.load()?;

        if let Some(existing) = file
            .assignments
            .iter()
            .find(|a| a.project_path == project_path && a.status == AssignmentStatus::Active)
        {
            if let Some(preferred_port) = preferred {
                if preferred_port != existing.port {
                    return Err(EngineError::PortConflict {
                        port: preferred_port,
                        other_project: project_path.display().to_string(),
                    });
                }
            }
            return Ok(existing.clone());
        }

        let in_use = self.in_use_ports(&file).await?;

        let assignment = if let Some(preferred_port) = preferred {
            if let Some(holder) = file
                .assignments
                .iter()
                .find(|a| a.status == AssignmentStatus::Active && a.port == preferred_port)
            {
                return Err(EngineError::PortConflict {
                    port: preferred_port,
                    other_project: holder.project_path.display().to_string(),
                });
            }
            if in_use.contains(&preferred_port) {
                return Err(EngineError::PortConflict {
                    port: preferred_port,
                    other_project: "a container outside the registry".to_string(),
                });
            }
            PortAssignment {
                project_path: project_path.clone(),
                port: preferred_port,
                assigned_at: chrono::Utc::now(),
                kind: AssignmentKind::Manual,
                status: AssignmentStatus::Active,
                container_name: None,
            }
        } else {
            let port = self
                .config
                .managed_range
                .clone()
                .find(|p| !in_use.contains(p))
                .ok_or_else(|| EngineError::PortsExhausted {
                    holders: file
                        .assignments
                        .iter()
                        .filter(|a| a.status == AssignmentStatus::Active)
                        .map(|a| (a.project_path.display().to_string(), a.port))
                        .collect(),
                })?;
            PortAssignment {
                project_path: project_path.clone(),
                port,
                assigned_at: chrono::Utc::now(),
                kind: AssignmentKind::Auto,
                status: AssignmentStatus::Active,
                container_name: None,
            }
        };

        file.assignments.push(assignment.clone());
        self.write_atomic(&file)?;
        debug!(project = %project_path.display(), port = assignment.port, "assigned port");
        Ok(assignment)
    }

    async fn in_use_ports(&self, file: &PortRegistryFile) -> EngineResult<HashSet<u16>> {
        let mut in_use: HashSet<u16> = file
            .assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Active)
            .map(|a| a.port)
            .collect();
        for state in self.gateway.list_containers(&self.name_prefix).await? {
            in_use.extend(state.ports.values().copied());
        }
        Ok(in_use)
    }

    /// Release `project_path`'s active assignment, if any. Idempotent.
    pub async fn release(&self, project_path: &Path) -> EngineResult<()> {
        let project_path = normalize_project_path(project_path)?;
        let (_lock, _lock_path) = self.acquire_lock()?;
        let mut file = self.load()?;
        file.assignments.retain(|a| a.project_path != project_path);
        self.write_atomic(&file)?;
        Ok(())
    }

    /// Look up the active assignment for `project_path`, if any.
    pub async fn get(&self, project_path: &Path) -> EngineResult<Option<PortAssignment>> {
        let project_path = normalize_project_path(project_path)?;
        let (_lock, _lock_path) = self.acquire_lock()?;
        let file = self.load()?;
        Ok(file
            .assignments
            .into_iter()
            .find(|a| a.project_path == project_path && a.status == AssignmentStatus::Active))
    }

    /// Record the container name backing an active assignment, used by
    /// `ContainerLifecycle::up` right after `CreateContainer` succeeds so
    /// that `cleanup_stale` has something to reconcile against.
    pub async fn record_container_name(&self, project_path: &Path, container_name: &str) -> EngineResult<()> {
        let project_path = normalize_project_path(project_path)?;
        let (_lock, _lock_path) = self.acquire_lock()?;
        let mut file = self.load()?;
        if let Some(assignment) = file
            .assignments
            .iter_mut()
            .find(|a| a.project_path == project_path && a.status == AssignmentStatus::Active)
        {
            assignment.container_name = Some(container_name.to_string());
        }
        self.write_atomic(&file)?;
        Ok(())
    }

    /// All assignments, any status.
    pub async fn list(&self) -> EngineResult<Vec<PortAssignment>> {
        let (_lock, _lock_path) = self.acquire_lock()?;
        Ok(self.load()?.assignments)
    }

    /// Drop every record. Administrative: used by tests and a user-invoked reset.
    pub async fn clear(&self) -> EngineResult<()> {
        let (_lock, _lock_path) = self.acquire_lock()?;
        self.write_atomic(&PortRegistryFile::new(chrono::Utc::now()))
    }

    /// Evict active records whose referenced container no longer exists in
    /// Docker, in any state. A stopped-but-still-present container keeps its
    /// reservation. Returns the evicted records.
    pub async fn cleanup_stale(&self) -> EngineResult<Vec<PortAssignment>> {
        let (_lock, _lock_path) = self.acquire_lock()?;
        let mut file = self.load()?;

        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(file.assignments.len());
        for assignment in file.assignments.drain(..) {
            let Some(container_name) = assignment.container_name.as_deref() else {
                kept.push(assignment);
                continue;
            };
            if assignment.status != AssignmentStatus::Active {
                kept.push(assignment);
                continue;
            }
            let state = self.gateway.inspect_container(container_name).await?;
            if state.phase == crate::types::ContainerPhase::Absent {
                evicted.push(assignment);
            } else {
                kept.push(assignment);
            }
        }
        file.assignments = kept;
        self.write_atomic(&file)?;
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockDockerGateway;

    fn registry(dir: &Path) -> PortRegistry {
        let config = PortRegistryConfig {
            registry_path: dir.join("port-registry.json"),
            managed_range: 1972..=1975,
        };
        PortRegistry::new(config, Arc::new(MockDockerGateway::new()), "iris_")
    }

    #[tokio::test]
    async fn assign_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let project = Path::new("/tmp/project-a");
        let first = reg.assign(project, None).await.unwrap();
        let second = reg.assign(project, None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn distinct_projects_get_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let a = reg.assign(Path::new("/tmp/a"), None).await.unwrap();
        let b = reg.assign(Path::new("/tmp/b"), None).await.unwrap();
        assert_ne!(a.port, b.port);
    }

    #[tokio::test]
    async fn exhausting_the_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        for i in 0..4 {
            reg.assign(&PathBuf::from(format!("/tmp/p{i}")), None).await.unwrap();
        }
        let err = reg.assign(Path::new("/tmp/overflow"), None).await.unwrap_err();
        assert!(matches!(err, EngineError::PortsExhausted { .. }));
    }

    #[tokio::test]
    async fn preferred_port_conflict_is_rejected_not_moved() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.assign(Path::new("/tmp/a"), Some(1972)).await.unwrap();
        let err = reg.assign(Path::new("/tmp/b"), Some(1972)).await.unwrap_err();
        assert!(matches!(err, EngineError::PortConflict { .. }));
    }

    #[tokio::test]
    async fn preferred_port_bound_out_of_band_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PortRegistryConfig {
            registry_path: dir.path().join("port-registry.json"),
            managed_range: 1972..=1975,
        };
        let gateway = Arc::new(MockDockerGateway::new());
        gateway
            .create_container(&crate::gateway::CreateContainerSpec {
                image: "intersystemsdc/iris-community:latest".to_string(),
                name: "iris_out_of_band".to_string(),
                env: std::collections::HashMap::new(),
                port_bindings: vec![(1972, 1972)],
                volumes: Vec::new(),
                labels: std::collections::HashMap::new(),
            })
            .await
            .unwrap();
        let reg = PortRegistry::new(config, gateway, "iris_");

        let err = reg.assign(Path::new("/tmp/a"), Some(1972)).await.unwrap_err();
        assert!(matches!(err, EngineError::PortConflict { port: 1972, .. }));
    }

    #[tokio::test]
    async fn release_then_reassign_may_change_port() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let project = Path::new("/tmp/a");
        reg.assign(project, None).await.unwrap();
        reg.release(project).await.unwrap();
        assert!(reg.get(project).await.unwrap().is_none());
        reg.assign(project, None).await.unwrap();
        assert!(reg.get(project).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn releasing_an_absent_project_is_a_no_op_success() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.release(Path::new("/tmp/never-assigned")).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_stale_evicts_only_nonexistent_containers() {
        let dir = tempfile::tempdir().unwrap();
        let config = PortRegistryConfig {
            registry_path: dir.path().join("port-registry.json"),
            managed_range: 1972..=1981,
        };
        let gateway = Arc::new(MockDockerGateway::new());
        let reg = PortRegistry::new(config, gateway.clone(), "iris_");

        let mut assignment = reg.assign(Path::new("/tmp/a"), None).await.unwrap();
        assignment.container_name = Some("iris_a".to_string());
        // Simulate the lifecycle recording the container name post-create by
        // re-writing the file directly through another assign call's shape:
        // here we just confirm cleanup_stale leaves a name-less record alone.
        let evicted = reg.cleanup_stale().await.unwrap();
        assert!(evicted.is_empty());
        assert!(reg.get(Path::new("/tmp/a")).await.unwrap().is_some());
    }
}
