//! `DockerGateway`: a minimal, strongly-typed surface over the Docker engine.
//!
//! The production implementation shells out to the `docker` CLI binary via
//! [`crate::executor::ProcessExecutor`] — the same mechanism the rest of
//! this crate's lineage uses throughout. A second, in-memory implementation
//! lets every other component be unit-tested without a Docker daemon.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};
use crate::executor::ProcessExecutor;
use crate::types::{ContainerId, ContainerPhase, ContainerState, VolumeMount};

/// Everything needed to create one container. Host-port bindings are
/// explicit: the caller (`ContainerLifecycle`) computes them from
/// `PortRegistry` ahead of time, never from an ephemeral Docker-assigned port.
#[derive(Debug, Clone)]
pub struct CreateContainerSpec {
    /// Resolved image reference.
    pub image: String,
    /// Container name.
    pub name: String,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// `(hostPort, containerPort)` explicit bindings.
    pub port_bindings: Vec<(u16, u16)>,
    /// Volume mounts to apply at create time.
    pub volumes: Vec<VolumeMount>,
    /// Labels applied at create time (tool identity, config source, version).
    pub labels: HashMap<String, String>,
}

/// Outcome of [`DockerGateway::exec_in_container`].
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Process exit code.
    pub exit_code: i32,
}

impl ExecOutcome {
    /// Whether the exec exited zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Thin typed wrapper over a Docker engine client. No business logic lives
/// here — only translation between the engine's shape and this crate's
/// types, plus normalization of engine failures into [`EngineError`].
#[async_trait]
pub trait DockerGateway: Send + Sync {
    /// Preflight reachability check; run once per `ContainerLifecycle`.
    async fn ping(&self) -> EngineResult<()>;

    /// Pull an image; a no-op if it is already present locally.
    async fn pull_image(&self, image_ref: &str) -> EngineResult<()>;

    /// Create (but do not start) a container.
    async fn create_container(&self, spec: &CreateContainerSpec) -> EngineResult<ContainerId>;

    /// Start a previously created container.
    async fn start_container(&self, id: &ContainerId) -> EngineResult<()>;

    /// Stop a container: soft terminate, then hard kill after `grace`.
    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> EngineResult<()>;

    /// Remove a container. Fails with `ContainerRunning` unless `force`.
    async fn remove_container(&self, id: &ContainerId, force: bool, remove_volumes: bool) -> EngineResult<()>;

    /// Inspect by name or id; returns `phase=absent` rather than erroring
    /// when nothing by that name exists.
    async fn inspect_container(&self, name_or_id: &str) -> EngineResult<ContainerState>;

    /// List containers whose name starts with `name_prefix`.
    async fn list_containers(&self, name_prefix: &str) -> EngineResult<Vec<ContainerState>>;

    /// Execute `argv` inside a running container, optionally piping `stdin`.
    async fn exec_in_container(
        &self,
        id: &ContainerId,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> EngineResult<ExecOutcome>;

    /// Stream log lines, optionally following and/or limited to the last
    /// `tail_lines`. The returned channel closes when the stream ends.
    async fn stream_logs(
        &self,
        id: &ContainerId,
        tail_lines: Option<usize>,
        follow: bool,
    ) -> EngineResult<mpsc::Receiver<String>>;
}

/// Production [`DockerGateway`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct CliDockerGateway {
    executor: ProcessExecutor,
}

impl CliDockerGateway {
    /// Build a gateway against an explicit `docker` binary path.
    #[must_use]
    pub fn new(docker_path: PathBuf) -> Self {
        Self {
            executor: ProcessExecutor::new(docker_path),
        }
    }

    /// Build a gateway, locating `docker` on `PATH`.
    pub fn discover() -> EngineResult<Self> {
        Ok(Self::new(crate::executor::find_docker_binary()?))
    }

    fn parse_inspect_json(data: &serde_json::Value, fallback_name: &str) -> EngineResult<ContainerState> {
        let id = data["Id"].as_str().map(|s| s.trim_start_matches("sha256:").to_string());
        let name = data["Name"]
            .as_str()
            .map(|s| s.trim_start_matches('/').to_string())
            .unwrap_or_else(|| fallback_name.to_string());
        let state = &data["State"];
        let running = state["Running"].as_bool().unwrap_or(false);
        let phase = if running {
            ContainerPhase::Running
        } else if id.is_some() {
            ContainerPhase::Stopped
        } else {
            ContainerPhase::Absent
        };

        let created_at = data["Created"].as_str().and_then(parse_docker_time);
        let started_at = state["StartedAt"].as_str().and_then(parse_docker_time);
        let finished_at = state["FinishedAt"].as_str().and_then(parse_docker_time);

        let mut ports = BTreeMap::new();
        if let Some(port_map) = data["NetworkSettings"]["Ports"].as_object() {
            for (container_port_proto, bindings) in port_map {
                let Some(container_port) = container_port_proto
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok())
                else {
                    continue;
                };
                if let Some(first_binding) = bindings.as_array().and_then(|a| a.first()) {
                    if let Some(host_port) = first_binding["HostPort"].as_str().and_then(|p| p.parse::<u16>().ok())
                    {
                        ports.insert(container_port, host_port);
                    }
                }
            }
        }

        let image = data["Config"]["Image"].as_str().unwrap_or_default().to_string();
        let config_source = data["Config"]["Labels"]["iris-devtester.config.source"]
            .as_str()
            .filter(|s| *s != "default")
            .map(str::to_string);

        let container_id = match id {
            Some(id) if phase != ContainerPhase::Absent => Some(ContainerId::new(id)?),
            _ => None,
        };

        Ok(ContainerState {
            container_id,
            container_name: name,
            phase,
            health: crate::types::HealthLabel::Unknown,
            created_at,
            started_at,
            finished_at,
            ports,
            image,
            config_source,
        })
    }
}

fn parse_docker_time(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if s.starts_with("0001-01-01") {
        return None;
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[async_trait]
impl DockerGateway for CliDockerGateway {
    async fn ping(&self) -> EngineResult<()> {
        self.executor.check_docker_available().await
    }

    async fn pull_image(&self, image_ref: &str) -> EngineResult<()> {
        debug!(image = %image_ref, "pulling image");
        self.executor
            .execute(&["pull".to_string(), image_ref.to_string()], None)
            .await
            .map_err(|_| EngineError::ImageNotFound {
                image: image_ref.to_string(),
            })?;
        Ok(())
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> EngineResult<ContainerId> {
        debug!(name = %spec.name, image = %spec.image, "creating container");
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];

        for (host_port, container_port) in &spec.port_bindings {
            args.push("--publish".to_string());
            args.push(format!("{host_port}:{container_port}"));
        }
        for mount in &spec.volumes {
            args.push("--volume".to_string());
            args.push(mount.to_docker_spec());
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let output = self.executor.execute(&args, None).await.map_err(|e| {
            classify_create_error(&spec.name, &spec.port_bindings, e)
        })?;
        let id = output.stdout.trim().to_string();
        info!(container_id = %id, "created container");
        ContainerId::new(id)
    }

    async fn start_container(&self, id: &ContainerId) -> EngineResult<()> {
        self.executor
            .execute(&["start".to_string(), id.to_string()], None)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> EngineResult<()> {
        self.executor
            .execute(
                &[
                    "stop".to_string(),
                    "--time".to_string(),
                    grace.as_secs().to_string(),
                    id.to_string(),
                ],
                None,
            )
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId, force: bool, remove_volumes: bool) -> EngineResult<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        if remove_volumes {
            args.push("--volumes".to_string());
        }
        args.push(id.to_string());

        self.executor.execute(&args, None).await.map_err(|e| {
            if !force && matches!(e, EngineError::EngineUnavailable { .. }) {
                EngineError::ContainerRunning { name: id.to_string() }
            } else {
                e
            }
        })?;
        Ok(())
    }

    async fn inspect_container(&self, name_or_id: &str) -> EngineResult<ContainerState> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            name_or_id.to_string(),
        ];
        match self.executor.execute(&args, None).await {
            Ok(output) => {
                let data: serde_json::Value = serde_json::from_str(&output.stdout)?;
                Self::parse_inspect_json(&data, name_or_id)
            }
            Err(_) => Ok(ContainerState::absent(name_or_id)),
        }
    }

    async fn list_containers(&self, name_prefix: &str) -> EngineResult<Vec<ContainerState>> {
        let args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--filter".to_string(),
            format!("name=^{name_prefix}"),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let output = self.executor.execute(&args, None).await?;
        let mut states = Vec::new();
        for name in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            states.push(self.inspect_container(name.trim()).await?);
        }
        Ok(states)
    }

    async fn exec_in_container(
        &self,
        id: &ContainerId,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> EngineResult<ExecOutcome> {
        let mut args = vec!["exec".to_string()];
        if stdin.is_some() {
            args.push("-i".to_string());
        }
        args.push(id.to_string());
        args.extend(argv.iter().cloned());

        let config = crate::executor::ExecutionConfig {
            stdin_data: stdin.map(<[u8]>::to_vec),
            ..Default::default()
        };

        match self.executor.execute(&args, Some(config)).await {
            Ok(output) => Ok(ExecOutcome {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
            }),
            Err(EngineError::EngineUnavailable { message }) => {
                // execute() turns a non-zero exit into an error; recover the
                // exit code so callers can distinguish terminal vs transient.
                Ok(ExecOutcome {
                    stdout: String::new(),
                    stderr: message,
                    exit_code: 1,
                })
            }
            Err(other) => Err(other),
        }
    }

    async fn stream_logs(
        &self,
        id: &ContainerId,
        tail_lines: Option<usize>,
        follow: bool,
    ) -> EngineResult<mpsc::Receiver<String>> {
        let mut args = vec!["logs".to_string()];
        if follow {
            args.push("--follow".to_string());
        }
        if let Some(tail) = tail_lines {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        args.push(id.to_string());

        let streaming = self.executor.execute_streaming(&args, None).await?;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stdout = streaming.stdout;
            while let Some(line) = stdout.recv().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

fn classify_create_error(name: &str, port_bindings: &[(u16, u16)], err: EngineError) -> EngineError {
    let EngineError::EngineUnavailable { message } = &err else {
        return err;
    };
    let lower = message.to_lowercase();
    if lower.contains("already in use") && lower.contains("name") {
        EngineError::NameInUse { name: name.to_string() }
    } else if lower.contains("port is already allocated") || lower.contains("address already in use") {
        let port = port_bindings.first().map_or(0, |(host, _)| *host);
        EngineError::PortAlreadyBound { port }
    } else if lower.contains("no such image") || lower.contains("not found") {
        EngineError::ImageNotFound {
            image: String::new(),
        }
    } else {
        err
    }
}

/// In-memory [`DockerGateway`] used to unit-test every other component
/// without a Docker daemon. Not a fidelity model of Docker's full behavior —
/// only enough to drive the state transitions this crate relies on.
#[derive(Debug, Default)]
pub struct MockDockerGateway {
    containers: std::sync::Mutex<HashMap<String, ContainerState>>,
    exec_responses: std::sync::Mutex<Vec<ExecOutcome>>,
    bound_ports: std::sync::Mutex<std::collections::HashSet<u16>>,
    /// stdin payload of every `exec_in_container` call, in call order.
    exec_stdins: std::sync::Mutex<Vec<Vec<u8>>>,
    fail_next_inspect: std::sync::atomic::AtomicBool,
    /// every `CreateContainerSpec` passed to `create_container`, in call order.
    created_specs: std::sync::Mutex<Vec<CreateContainerSpec>>,
}

impl MockDockerGateway {
    /// An empty mock with nothing running.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next `exec_in_container` response (FIFO).
    pub fn push_exec_response(&self, outcome: ExecOutcome) {
        self.exec_responses.lock().unwrap().push(outcome);
    }

    /// Directly seed a container's observed state, as if Docker already knew
    /// about it (used to test reconciliation/staleness paths).
    pub fn seed_container(&self, state: ContainerState) {
        self.containers.lock().unwrap().insert(state.container_name.clone(), state);
    }

    /// Manually remove a container, simulating an out-of-band `docker rm`.
    pub fn remove_out_of_band(&self, name: &str) {
        self.containers.lock().unwrap().remove(name);
    }

    /// Make the next `inspect_container` call fail as if the engine itself
    /// were unreachable, instead of answering normally.
    pub fn fail_next_inspect(&self) {
        self.fail_next_inspect.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// The stdin payload (as UTF-8) of every `exec_in_container` call so far,
    /// in call order. Used to assert on the shape of an admin script.
    #[must_use]
    pub fn recorded_exec_scripts(&self) -> Vec<String> {
        self.exec_stdins
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    /// Every `CreateContainerSpec` passed to `create_container` so far, in
    /// call order. Used to assert on volume-mount and other create-time args
    /// without shelling out to a real Docker engine.
    #[must_use]
    pub fn created_specs(&self) -> Vec<CreateContainerSpec> {
        self.created_specs.lock().unwrap().clone()
    }
}

#[async_trait]
impl DockerGateway for MockDockerGateway {
    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn pull_image(&self, _image_ref: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> EngineResult<ContainerId> {
        self.created_specs.lock().unwrap().push(spec.clone());
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(EngineError::NameInUse { name: spec.name.clone() });
        }
        let mut bound = self.bound_ports.lock().unwrap();
        for (host_port, _) in &spec.port_bindings {
            if !bound.insert(*host_port) {
                return Err(EngineError::PortAlreadyBound { port: *host_port });
            }
        }
        let id = ContainerId::new(format!("{:012x}", containers.len() + 1))?;
        let ports = spec.port_bindings.iter().map(|(h, c)| (*c, *h)).collect();
        containers.insert(
            spec.name.clone(),
            ContainerState {
                container_id: Some(id.clone()),
                container_name: spec.name.clone(),
                phase: ContainerPhase::Creating,
                health: crate::types::HealthLabel::Unknown,
                created_at: Some(chrono::Utc::now()),
                started_at: None,
                finished_at: None,
                ports,
                image: spec.image.clone(),
                config_source: spec.labels.get("iris-devtester.config.source").cloned(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> EngineResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let state = containers
            .values_mut()
            .find(|c| c.container_id.as_ref() == Some(id))
            .ok_or_else(|| EngineError::ContainerNotFound { name: id.to_string() })?;
        state.phase = ContainerPhase::Running;
        state.started_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId, _grace: Duration) -> EngineResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let state = containers
            .values_mut()
            .find(|c| c.container_id.as_ref() == Some(id))
            .ok_or_else(|| EngineError::ContainerNotFound { name: id.to_string() })?;
        state.phase = ContainerPhase::Stopped;
        state.finished_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId, force: bool, _remove_volumes: bool) -> EngineResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let name = containers
            .iter()
            .find(|(_, c)| c.container_id.as_ref() == Some(id))
            .map(|(name, c)| (name.clone(), c.phase));
        let Some((name, phase)) = name else {
            return Err(EngineError::ContainerNotFound { name: id.to_string() });
        };
        if phase == ContainerPhase::Running && !force {
            return Err(EngineError::ContainerRunning { name });
        }
        if let Some(removed) = containers.remove(&name) {
            let mut bound = self.bound_ports.lock().unwrap();
            for host_port in removed.ports.values() {
                bound.remove(host_port);
            }
        }
        Ok(())
    }

    async fn inspect_container(&self, name_or_id: &str) -> EngineResult<ContainerState> {
        if self.fail_next_inspect.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(EngineError::EngineUnavailable {
                message: "simulated transport failure".to_string(),
            });
        }
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .get(name_or_id)
            .cloned()
            .or_else(|| {
                containers
                    .values()
                    .find(|c| c.container_id.as_ref().map(|id| id.as_str()) == Some(name_or_id))
                    .cloned()
            })
            .unwrap_or_else(|| ContainerState::absent(name_or_id)))
    }

    async fn list_containers(&self, name_prefix: &str) -> EngineResult<Vec<ContainerState>> {
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .values()
            .filter(|c| c.container_name.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn exec_in_container(
        &self,
        _id: &ContainerId,
        _argv: &[String],
        stdin: Option<&[u8]>,
    ) -> EngineResult<ExecOutcome> {
        self.exec_stdins
            .lock()
            .unwrap()
            .push(stdin.map(<[u8]>::to_vec).unwrap_or_default());
        let mut responses = self.exec_responses.lock().unwrap();
        if responses.is_empty() {
            Ok(ExecOutcome {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn stream_logs(
        &self,
        _id: &ContainerId,
        _tail_lines: Option<usize>,
        _follow: bool,
    ) -> EngineResult<mpsc::Receiver<String>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, host_port: u16) -> CreateContainerSpec {
        CreateContainerSpec {
            image: "intersystemsdc/iris-community:latest".to_string(),
            name: name.to_string(),
            env: HashMap::new(),
            port_bindings: vec![(host_port, 1972)],
            volumes: Vec::new(),
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_start_inspect_round_trips() {
        let gateway = MockDockerGateway::new();
        let id = gateway.create_container(&spec("iris_a", 1972)).await.unwrap();
        gateway.start_container(&id).await.unwrap();
        let state = gateway.inspect_container("iris_a").await.unwrap();
        assert_eq!(state.phase, ContainerPhase::Running);
        assert_eq!(state.ports.get(&1972), Some(&1972));
    }

    #[tokio::test]
    async fn read_only_volume_mount_is_recorded_verbatim() {
        let gateway = MockDockerGateway::new();
        let mut create_spec = spec("iris_a", 1972);
        create_spec.volumes.push(VolumeMount {
            host_path: PathBuf::from("/host/data"),
            container_path: "/container/data".to_string(),
            mode: crate::types::MountMode::Ro,
        });
        gateway.create_container(&create_spec).await.unwrap();

        let recorded = gateway.created_specs();
        assert_eq!(recorded.len(), 1);
        let mount = &recorded[0].volumes[0];
        assert_eq!(mount.mode, crate::types::MountMode::Ro);
        assert_eq!(mount.to_docker_spec(), "/host/data:/container/data:ro");
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let gateway = MockDockerGateway::new();
        gateway.create_container(&spec("iris_a", 1972)).await.unwrap();
        let err = gateway.create_container(&spec("iris_a", 1973)).await.unwrap_err();
        assert!(matches!(err, EngineError::NameInUse { .. }));
    }

    #[tokio::test]
    async fn duplicate_port_is_rejected() {
        let gateway = MockDockerGateway::new();
        gateway.create_container(&spec("iris_a", 1972)).await.unwrap();
        let err = gateway.create_container(&spec("iris_b", 1972)).await.unwrap_err();
        assert!(matches!(err, EngineError::PortAlreadyBound { port: 1972 }));
    }

    #[tokio::test]
    async fn remove_running_without_force_fails() {
        let gateway = MockDockerGateway::new();
        let id = gateway.create_container(&spec("iris_a", 1972)).await.unwrap();
        gateway.start_container(&id).await.unwrap();
        let err = gateway.remove_container(&id, false, false).await.unwrap_err();
        assert!(matches!(err, EngineError::ContainerRunning { .. }));
        gateway.remove_container(&id, true, false).await.unwrap();
        assert_eq!(
            gateway.inspect_container("iris_a").await.unwrap().phase,
            ContainerPhase::Absent
        );
    }

    #[tokio::test]
    async fn inspect_unknown_name_reports_absent() {
        let gateway = MockDockerGateway::new();
        let state = gateway.inspect_container("nope").await.unwrap();
        assert_eq!(state.phase, ContainerPhase::Absent);
    }
}
