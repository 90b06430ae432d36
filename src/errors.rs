//! Closed error taxonomy for the container orchestration engine.
//!
//! Every error the engine surfaces carries a kind from this set plus enough
//! structured context to render a four-part diagnostic (symptom / context /
//! remediation / reference) without the core ever producing that rendering
//! itself — that is the UI layer's job.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Result type alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Sub-cause of a `RemediationFailed` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationCause {
    /// The database rejected the new password outright.
    PasswordRejected,
    /// The database rejected enabling the privileged service.
    ServiceEnableRejected,
    /// The exec call failed with a non-retryable exit code or transport error.
    ExecNonRetryable,
}

impl std::fmt::Display for RemediationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PasswordRejected => "password_rejected",
            Self::ServiceEnableRejected => "service_enable_rejected",
            Self::ExecNonRetryable => "exec_non_retryable",
        };
        f.write_str(s)
    }
}

/// The closed set of error kinds the engine emits.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Config validation failed before any external effect occurred.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was invalid.
        message: String,
    },

    /// The Docker engine itself could not be reached.
    #[error("docker engine unavailable: {message}")]
    EngineUnavailable {
        /// Details from the underlying transport/process failure.
        message: String,
    },

    /// The registry denied or could not find the requested image.
    #[error("image not found: {image}")]
    ImageNotFound {
        /// The image reference that could not be pulled.
        image: String,
    },

    /// Transport failure while talking to the registry.
    #[error("registry unreachable while pulling {image}: {message}")]
    RegistryUnreachable {
        /// The image reference being pulled.
        image: String,
        /// Details of the transport failure.
        message: String,
    },

    /// A container with the requested name already exists.
    #[error("container name already in use: {name}")]
    NameInUse {
        /// The conflicting container name.
        name: String,
    },

    /// The requested host port is already bound by another process or container.
    #[error("port already bound: {port}")]
    PortAlreadyBound {
        /// The host port that was already bound.
        port: u16,
    },

    /// A volume mount specification could not be honored.
    #[error("invalid mount '{spec}': {reason}")]
    InvalidMount {
        /// The raw mount specification.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The named container is running when the operation requires it to be stopped.
    #[error("container is running: {name}")]
    ContainerRunning {
        /// The container's name.
        name: String,
    },

    /// The named container does not exist.
    #[error("container not found: {name}")]
    ContainerNotFound {
        /// The container name or ID that was not found.
        name: String,
    },

    /// The managed port range has no free ports left.
    #[error("managed port range exhausted; current holders: {holders:?}")]
    PortsExhausted {
        /// `(projectPath, port)` pairs currently holding the managed range.
        holders: Vec<(String, u16)>,
    },

    /// A preferred port conflicts with another project's active assignment.
    #[error("port {port} is already assigned to project {other_project}")]
    PortConflict {
        /// The requested port.
        port: u16,
        /// The project path that already holds it.
        other_project: String,
    },

    /// The port-registry file lock could not be acquired in time.
    #[error("timed out acquiring port registry lock at {lock_path} after {timeout:?}")]
    LockTimeout {
        /// Path of the lock file.
        lock_path: String,
        /// How long the caller waited.
        timeout: Duration,
    },

    /// The port-registry file exists but could not be parsed or carries an
    /// unsupported schema version.
    #[error("port registry at {path} is corrupted: {reason} (run a registry clear to recover)")]
    RegistryCorrupted {
        /// Path of the registry file.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A health probe did not reach the requested level within its budget.
    #[error("health check timed out at level {level} after {budget:?}")]
    HealthTimeout {
        /// The level that timed out (`minimal`, `standard`, `full`).
        level: String,
        /// The budget allotted to that level.
        budget: Duration,
    },

    /// `Up` found an existing, running-but-unhealthy container and refused to
    /// recreate it silently.
    #[error("existing container {name} is unhealthy: {detail}")]
    UnhealthyExistingContainer {
        /// The container's name.
        name: String,
        /// What the health probe observed.
        detail: String,
    },

    /// A previously-resolved container identifier no longer resolves.
    #[error("stale container reference: {name}")]
    StaleReference {
        /// The container name whose identifier no longer resolves.
        name: String,
    },

    /// A remediation action exhausted its retries or hit a terminal failure.
    #[error("remediation failed ({cause}): {message}")]
    RemediationFailed {
        /// The specific sub-cause.
        cause: RemediationCause,
        /// Details, including the last exit code/stderr line when applicable.
        message: String,
    },

    /// A lifecycle-owning operation was attempted on a handle produced by `Attach`.
    #[error("operation not permitted on an attached handle for {name}: this process does not own its lifecycle")]
    AttachedHandle {
        /// The container's name.
        name: String,
    },

    /// The operation was cancelled by its caller.
    #[error("operation cancelled: {message}")]
    Cancelled {
        /// What was in progress when cancellation was observed.
        message: String,
    },

    /// An overall operation deadline elapsed.
    #[error("deadline exceeded after {elapsed:?}: {message}")]
    DeadlineExceeded {
        /// How long the operation had been running.
        elapsed: Duration,
        /// What was in progress.
        message: String,
    },

    /// Local filesystem I/O failure underlying a registry or config operation.
    #[error("io error during {operation}: {source}")]
    Io {
        /// What was being attempted.
        operation: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failure.
    #[error("json error in {context}: {source}")]
    Json {
        /// What was being parsed or written.
        context: String,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    /// Broad category, used for grouping and for the UI layer's exit-code mapping.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config",
            Self::EngineUnavailable { .. }
            | Self::ImageNotFound { .. }
            | Self::RegistryUnreachable { .. }
            | Self::NameInUse { .. }
            | Self::PortAlreadyBound { .. }
            | Self::InvalidMount { .. }
            | Self::ContainerRunning { .. }
            | Self::ContainerNotFound { .. } => "engine",
            Self::PortsExhausted { .. }
            | Self::PortConflict { .. }
            | Self::LockTimeout { .. }
            | Self::RegistryCorrupted { .. } => "registry",
            Self::HealthTimeout { .. }
            | Self::UnhealthyExistingContainer { .. }
            | Self::StaleReference { .. } => "health",
            Self::RemediationFailed { .. } => "remediation",
            Self::AttachedHandle { .. } | Self::Cancelled { .. } | Self::DeadlineExceeded { .. } => {
                "lifecycle"
            }
            Self::Io { .. } => "io",
            Self::Json { .. } => "json",
        }
    }

    /// Whether the engine itself may retry this error internally. This is
    /// distinct from the UI layer's decision to retry a whole operation: it
    /// only covers the transient, engine-exec-transport class of failures
    /// that `Remediator` and `PortRegistry`'s lock loop know how to wait out.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EngineUnavailable { .. } | Self::RegistryUnreachable { .. } | Self::LockTimeout { .. }
        )
    }

    /// Structured diagnostic rendering parts: symptom, remediation hint, and
    /// a stable reference tag. The UI layer composes these (plus whatever
    /// context fields the variant carries) into the four-part message.
    #[must_use]
    pub fn diagnostic(&self) -> Diagnostic {
        let (remediation, reference) = match self {
            Self::InvalidConfig { .. } => (
                "fix the named field and retry; no external effect occurred",
                "ERR-CONFIG-001",
            ),
            Self::EngineUnavailable { .. } => (
                "verify the Docker daemon is running and reachable from this host",
                "ERR-ENGINE-001",
            ),
            Self::ImageNotFound { .. } => (
                "check the image reference and edition; community and enterprise images live under different registry namespaces",
                "ERR-ENGINE-002",
            ),
            Self::RegistryUnreachable { .. } => (
                "check network connectivity to the image registry and retry",
                "ERR-ENGINE-003",
            ),
            Self::NameInUse { .. } => (
                "remove or rename the existing container, or attach to it instead",
                "ERR-ENGINE-004",
            ),
            Self::PortAlreadyBound { .. } => (
                "choose a different port or stop whatever process is already bound to it",
                "ERR-ENGINE-005",
            ),
            Self::InvalidMount { .. } => (
                "use host:container[:mode] syntax with an absolute container path",
                "ERR-ENGINE-006",
            ),
            Self::ContainerRunning { .. } => (
                "stop the container first, or pass force to remove it while running",
                "ERR-ENGINE-007",
            ),
            Self::ContainerNotFound { .. } => (
                "verify the container name and that it has not already been removed",
                "ERR-ENGINE-008",
            ),
            Self::PortsExhausted { .. } => (
                "release an existing assignment or widen the managed port range",
                "ERR-REGISTRY-001",
            ),
            Self::PortConflict { .. } => (
                "pick an unused port, or omit the preferred port to get an auto-assigned one",
                "ERR-REGISTRY-002",
            ),
            Self::LockTimeout { .. } => (
                "retry; if this persists, check for a stuck process holding the lock file",
                "ERR-REGISTRY-003",
            ),
            Self::RegistryCorrupted { .. } => (
                "run a registry clear to rebuild the file from scratch",
                "ERR-REGISTRY-004",
            ),
            Self::HealthTimeout { .. } => (
                "inspect container logs; the container may need more time or may be misconfigured",
                "ERR-HEALTH-001",
            ),
            Self::UnhealthyExistingContainer { .. } => (
                "inspect and remediate the existing container, or remove it and retry Up",
                "ERR-HEALTH-002",
            ),
            Self::StaleReference { .. } => (
                "re-resolve the container by name; it was recreated or renamed externally",
                "ERR-HEALTH-003",
            ),
            Self::RemediationFailed { .. } => (
                "inspect the container's admin logs for the exact rejection reason",
                "ERR-REMEDIATION-001",
            ),
            Self::AttachedHandle { .. } => (
                "use the owning process, or call Remove/Stop against the container by name instead",
                "ERR-LIFECYCLE-001",
            ),
            Self::Cancelled { .. } => ("retry the operation", "ERR-LIFECYCLE-002"),
            Self::DeadlineExceeded { .. } => (
                "increase the operation's deadline or investigate why it is slow",
                "ERR-LIFECYCLE-003",
            ),
            Self::Io { .. } => ("check filesystem permissions and available disk space", "ERR-IO-001"),
            Self::Json { .. } => ("the underlying data is malformed; inspect it manually", "ERR-JSON-001"),
        };
        Diagnostic {
            symptom: self.to_string(),
            context: self.context(),
            remediation: remediation.to_string(),
            reference: reference.to_string(),
        }
    }

    fn context(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        match self {
            Self::ImageNotFound { image } | Self::RegistryUnreachable { image, .. } => {
                ctx.insert("image".to_string(), image.clone());
            }
            Self::NameInUse { name }
            | Self::ContainerRunning { name }
            | Self::ContainerNotFound { name }
            | Self::UnhealthyExistingContainer { name, .. }
            | Self::StaleReference { name }
            | Self::AttachedHandle { name } => {
                ctx.insert("container_name".to_string(), name.clone());
            }
            Self::PortAlreadyBound { port } => {
                ctx.insert("port".to_string(), port.to_string());
            }
            Self::PortConflict { port, other_project } => {
                ctx.insert("port".to_string(), port.to_string());
                ctx.insert("other_project".to_string(), other_project.clone());
            }
            Self::LockTimeout { lock_path, .. } | Self::RegistryCorrupted { path: lock_path, .. } => {
                ctx.insert("path".to_string(), lock_path.clone());
            }
            _ => {}
        }
        ctx
    }
}

impl From<std::io::Error> for EngineError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            operation: "filesystem access".to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(source: serde_json::Error) -> Self {
        Self::Json {
            context: "deserialize".to_string(),
            source,
        }
    }
}

/// The four rendering parts the UI layer needs: symptom, structured context,
/// a remediation hint, and a stable reference tag for documentation lookup.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Concise description of what went wrong.
    pub symptom: String,
    /// Structured context (container name, port, engine message, ...).
    pub context: HashMap<String, String>,
    /// A concrete, actionable remediation step.
    pub remediation: String,
    /// Stable reference tag for documentation lookup.
    pub reference: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_groups_match_taxonomy() {
        assert_eq!(EngineError::InvalidConfig { message: "x".into() }.category(), "config");
        assert_eq!(
            EngineError::PortsExhausted { holders: vec![] }.category(),
            "registry"
        );
        assert_eq!(
            EngineError::AttachedHandle { name: "iris_db".into() }.category(),
            "lifecycle"
        );
    }

    #[test]
    fn every_diagnostic_has_a_remediation() {
        let err = EngineError::PortConflict {
            port: 1972,
            other_project: "/tmp/a".into(),
        };
        let diag = err.diagnostic();
        assert!(!diag.remediation.is_empty());
        assert!(!diag.reference.is_empty());
        assert_eq!(diag.context.get("port").map(String::as_str), Some("1972"));
    }

    #[test]
    fn lock_timeout_is_retryable_but_config_is_not() {
        assert!(EngineError::LockTimeout {
            lock_path: "/tmp/x.lock".into(),
            timeout: Duration::from_secs(5)
        }
        .is_retryable());
        assert!(!EngineError::InvalidConfig { message: "x".into() }.is_retryable());
    }
}
