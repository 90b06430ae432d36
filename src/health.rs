//! Progressive, layered readiness probe with a short-TTL cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::EngineResult;
use crate::gateway::DockerGateway;
use crate::types::{ContainerId, ContainerPhase, HealthCheckResult, HealthLevel, HealthStatus};

const CACHE_TTL: Duration = Duration::from_secs(5);

/// In-memory TTL cache keyed by `(containerName, level)`, amortizing
/// repeated near-term probes. Owned exclusively by `HealthChecker`.
#[derive(Default)]
pub struct ValidationCache {
    entries: Mutex<HashMap<(String, HealthLevel), (Instant, HealthCheckResult)>>,
}

impl ValidationCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, container_name: &str, level: HealthLevel) -> Option<HealthCheckResult> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&(container_name.to_string(), level))
            .filter(|(observed, _)| observed.elapsed() < CACHE_TTL)
            .map(|(_, result)| result.clone())
    }

    fn put(&self, container_name: &str, level: HealthLevel, result: HealthCheckResult) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert((container_name.to_string(), level), (Instant::now(), result));
    }

    /// Invalidate every cached result for a container. Called by
    /// `ContainerLifecycle` on `Start`/`Stop`/`Remove`.
    pub fn invalidate(&self, container_name: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(name, _), _| name != container_name);
    }
}

/// Answers "is this container usable?" at three increasing levels of
/// assurance with bounded latency. Read-only: never mutates container state.
pub struct HealthChecker {
    gateway: std::sync::Arc<dyn DockerGateway>,
    cache: ValidationCache,
    /// The last container id resolved for each name, used to notice a
    /// rename/recreate that happens without this process ever observing the
    /// name go absent in between.
    last_seen_ids: Mutex<HashMap<String, ContainerId>>,
}

impl HealthChecker {
    /// Build a checker against the given gateway.
    #[must_use]
    pub fn new(gateway: std::sync::Arc<dyn DockerGateway>) -> Self {
        Self {
            gateway,
            cache: ValidationCache::new(),
            last_seen_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Invalidate the cache for one container (delegates to `ValidationCache`)
    /// and forget its last-seen identifier, so a subsequent recreate is not
    /// mistaken for a stale reference.
    pub fn invalidate(&self, container_name: &str) {
        self.cache.invalidate(container_name);
        self.last_seen_ids.lock().unwrap().remove(container_name);
    }

    /// Run the layered probe up to `level`, aborting at the first failing
    /// sub-check. A cache hit within the TTL skips re-probing entirely.
    pub async fn validate(&self, container_name: &str, level: HealthLevel) -> EngineResult<HealthCheckResult> {
        if let Some(cached) = self.cache.get(container_name, level) {
            debug!(container = %container_name, %level, "health cache hit");
            return Ok(cached);
        }

        let overall_start = Instant::now();
        let mut latest = None;
        for probe_level in level.ascending_through() {
            let probe_level = *probe_level;
            let budget = probe_level.budget();
            let result = match timeout(budget, self.probe_once(container_name, probe_level)).await {
                Ok(result) => result?,
                Err(_) => HealthCheckResult::failure(
                    HealthStatus::RunningNotAccessible,
                    probe_level,
                    overall_start.elapsed().as_millis() as u64,
                    format!("{probe_level} probe exceeded its {budget:?} budget"),
                ),
            };
            let healthy = result.is_healthy();
            latest = Some(result);
            if !healthy {
                break;
            }
        }

        let result = latest.expect("ascending_through always yields at least one level");
        self.cache.put(container_name, level, result.clone());
        Ok(result)
    }

    async fn probe_once(&self, container_name: &str, level: HealthLevel) -> EngineResult<HealthCheckResult> {
        let start = Instant::now();
        let latency_ms = || start.elapsed().as_millis() as u64;

        let state = match self.gateway.inspect_container(container_name).await {
            Ok(state) => state,
            Err(e) => {
                return Ok(HealthCheckResult::failure(
                    HealthStatus::EngineError,
                    level,
                    latency_ms(),
                    format!("docker engine failed to answer inspect: {e}"),
                ));
            }
        };

        if state.phase == ContainerPhase::Absent {
            self.last_seen_ids.lock().unwrap().remove(container_name);
            return Ok(HealthCheckResult::failure(
                HealthStatus::NotFound,
                level,
                latency_ms(),
                format!("no container named {container_name} is known to Docker"),
            ));
        }

        if let Some(container_id) = state.container_id.clone() {
            let previous = self
                .last_seen_ids
                .lock()
                .unwrap()
                .insert(container_name.to_string(), container_id.clone());
            if let Some(previous) = previous {
                if previous != container_id {
                    return Ok(HealthCheckResult::failure(
                        HealthStatus::StaleReference,
                        level,
                        latency_ms(),
                        format!(
                            "{container_name} now resolves to {container_id} but this process last saw {previous}"
                        ),
                    ));
                }
            }
        }

        if state.phase != ContainerPhase::Running {
            return Ok(HealthCheckResult::failure(
                HealthStatus::NotRunning,
                level,
                latency_ms(),
                format!("container {container_name} is in phase {:?}", state.phase),
            ));
        }
        if level == HealthLevel::Minimal {
            return Ok(HealthCheckResult::healthy(level, latency_ms()));
        }

        let Some(container_id) = state.container_id.clone() else {
            return Ok(HealthCheckResult::failure(
                HealthStatus::RunningNotAccessible,
                level,
                latency_ms(),
                "running container has no resolvable id".to_string(),
            ));
        };

        if level == HealthLevel::Standard || level == HealthLevel::Full {
            let outcome = match self
                .gateway
                .exec_in_container(&container_id, &["true".to_string()], None)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    return Ok(HealthCheckResult::failure(
                        HealthStatus::EngineError,
                        level,
                        latency_ms(),
                        format!("docker engine failed to answer exec: {e}"),
                    ));
                }
            };
            if !outcome.is_success() {
                return Ok(HealthCheckResult::failure(
                    HealthStatus::RunningNotAccessible,
                    HealthLevel::Standard,
                    latency_ms(),
                    format!("exec probe exited {}: {}", outcome.exit_code, outcome.stderr.trim()),
                ));
            }
        }
        if level == HealthLevel::Standard {
            return Ok(HealthCheckResult::healthy(level, latency_ms()));
        }

        // Full: a database-level liveness probe. No database driver
        // dependency is added; a raw TCP handshake against the resolved
        // primary port stands in for "the database responds to a query".
        let Some(&primary_port) = state.ports.values().next() else {
            return Ok(HealthCheckResult::failure(
                HealthStatus::RunningNotAccessible,
                HealthLevel::Full,
                latency_ms(),
                "container has no published port to probe".to_string(),
            ));
        };
        match TcpStream::connect(("127.0.0.1", primary_port)).await {
            Ok(_) => Ok(HealthCheckResult::healthy(HealthLevel::Full, latency_ms())),
            Err(e) => Ok(HealthCheckResult::failure(
                HealthStatus::RunningNotAccessible,
                HealthLevel::Full,
                latency_ms(),
                format!("tcp connect to 127.0.0.1:{primary_port} failed: {e}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CreateContainerSpec, MockDockerGateway};
    use crate::ContainerState;
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn running_container(gateway: &MockDockerGateway, name: &str, port: u16) {
        let id = gateway
            .create_container(&CreateContainerSpec {
                image: "intersystemsdc/iris-community:latest".to_string(),
                name: name.to_string(),
                env: HashMap::new(),
                port_bindings: vec![(port, 1972)],
                volumes: Vec::new(),
                labels: HashMap::new(),
            })
            .await
            .unwrap();
        gateway.start_container(&id).await.unwrap();
    }

    #[tokio::test]
    async fn minimal_succeeds_for_a_running_container() {
        let gateway = Arc::new(MockDockerGateway::new());
        running_container(&gateway, "iris_a", 19720).await;
        let checker = HealthChecker::new(gateway);
        let result = checker.validate("iris_a", HealthLevel::Minimal).await.unwrap();
        assert!(result.is_healthy());
    }

    #[tokio::test]
    async fn not_found_for_unknown_container() {
        let gateway = Arc::new(MockDockerGateway::new());
        let checker = HealthChecker::new(gateway);
        let result = checker.validate("iris_nope", HealthLevel::Minimal).await.unwrap();
        assert_eq!(result.status, HealthStatus::NotFound);
    }

    #[tokio::test]
    async fn standard_fails_when_exec_exits_nonzero() {
        let gateway = Arc::new(MockDockerGateway::new());
        running_container(&gateway, "iris_a", 19721).await;
        gateway.push_exec_response(crate::gateway::ExecOutcome {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code: 1,
        });
        let checker = HealthChecker::new(gateway);
        let result = checker.validate("iris_a", HealthLevel::Standard).await.unwrap();
        assert_eq!(result.status, HealthStatus::RunningNotAccessible);
        assert_eq!(result.level, HealthLevel::Standard);
    }

    #[tokio::test]
    async fn repeated_validate_within_ttl_hits_cache() {
        let gateway = Arc::new(MockDockerGateway::new());
        running_container(&gateway, "iris_a", 19722).await;
        let checker = HealthChecker::new(gateway.clone());
        let first = checker.validate("iris_a", HealthLevel::Minimal).await.unwrap();
        gateway.remove_out_of_band("iris_a");
        let second = checker.validate("iris_a", HealthLevel::Minimal).await.unwrap();
        assert_eq!(first.observed_at, second.observed_at);
    }

    #[tokio::test]
    async fn full_level_fails_when_nothing_listens_on_the_port() {
        let gateway = Arc::new(MockDockerGateway::new());
        running_container(&gateway, "iris_a", 19724).await;
        let checker = HealthChecker::new(gateway);
        let result = checker.validate("iris_a", HealthLevel::Full).await.unwrap();
        assert_eq!(result.status, HealthStatus::RunningNotAccessible);
        assert_eq!(result.level, HealthLevel::Full);
    }

    #[tokio::test]
    async fn engine_error_status_when_inspect_fails() {
        let gateway = Arc::new(MockDockerGateway::new());
        gateway.fail_next_inspect();
        let checker = HealthChecker::new(gateway);
        let result = checker.validate("iris_a", HealthLevel::Minimal).await.unwrap();
        assert_eq!(result.status, HealthStatus::EngineError);
    }

    #[tokio::test]
    async fn stale_reference_detected_when_id_changes_without_an_observed_absence() {
        let gateway = Arc::new(MockDockerGateway::new());
        running_container(&gateway, "iris_a", 19725).await;
        let checker = HealthChecker::new(gateway.clone());
        let first = checker.validate("iris_a", HealthLevel::Minimal).await.unwrap();
        assert!(first.is_healthy());

        // Simulate a recreate that reuses the name without ever going through
        // an observed absence: seed a fresh state with a different id, same
        // name, still running.
        gateway.seed_container(ContainerState {
            container_id: Some(crate::types::ContainerId::new("b".repeat(12)).unwrap()),
            container_name: "iris_a".to_string(),
            phase: ContainerPhase::Running,
            health: crate::types::HealthLabel::Unknown,
            created_at: Some(chrono::Utc::now()),
            started_at: Some(chrono::Utc::now()),
            finished_at: None,
            ports: std::collections::BTreeMap::from([(1972, 19725)]),
            image: "intersystemsdc/iris-community:latest".to_string(),
            config_source: None,
        });

        // Probe at a different level so this misses the TTL cache the first
        // call populated and actually re-inspects the container.
        let second = checker.validate("iris_a", HealthLevel::Standard).await.unwrap();
        assert_eq!(second.status, HealthStatus::StaleReference);
    }

    #[tokio::test]
    async fn invalidate_clears_the_cache() {
        let gateway = Arc::new(MockDockerGateway::new());
        running_container(&gateway, "iris_a", 19723).await;
        let checker = HealthChecker::new(gateway.clone());
        checker.validate("iris_a", HealthLevel::Minimal).await.unwrap();
        checker.invalidate("iris_a");
        gateway.remove_out_of_band("iris_a");
        let result = checker.validate("iris_a", HealthLevel::Minimal).await.unwrap();
        assert_eq!(result.status, HealthStatus::NotFound);
    }
}
