//! Core data model: validated configuration, observed container state, port
//! assignments, health results, and the progress event stream.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// A validated, full 64-character hex container identifier, or the shorter
/// form Docker accepts on the command line. Mirrors the validation the
/// engine applies to anything it hands back to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Validate and wrap a container identifier string.
    pub fn new(id: impl Into<String>) -> EngineResult<Self> {
        let id = id.into();
        if id.len() < 12 || id.len() > 64 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::InvalidConfig {
                message: format!("'{id}' is not a valid container id"),
            });
        }
        Ok(Self(id.to_lowercase()))
    }

    /// The first 12 characters, the form Docker prints by default.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }

    /// Borrow the full identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// The two publishing editions. Determines which registry namespace
/// `ImageResolver` resolves images from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    /// Community edition, hosted under `intersystemsdc`.
    Community,
    /// Enterprise edition, hosted under `intersystems`, requires a license key.
    Enterprise,
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Community => f.write_str("community"),
            Self::Enterprise => f.write_str("enterprise"),
        }
    }
}

/// Mount mode for a volume specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    /// Read-write (the default when unspecified).
    Rw,
    /// Read-only.
    Ro,
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rw => f.write_str("rw"),
            Self::Ro => f.write_str("ro"),
        }
    }
}

/// One volume mount: `(hostPath, containerPath, mode)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Path on the host.
    pub host_path: PathBuf,
    /// Absolute path inside the container.
    pub container_path: String,
    /// Read-write or read-only.
    pub mode: MountMode,
}

impl VolumeMount {
    /// Render as Docker's `host:container[:mode]` bind-mount syntax.
    #[must_use]
    pub fn to_docker_spec(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode
        )
    }
}

const CONTAINER_NAME_RE_CHARS: fn(char, bool) -> bool = |c, first| {
    if first {
        c.is_ascii_alphanumeric()
    } else {
        c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
    }
};

fn validate_container_name(name: &str) -> EngineResult<()> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(first) => CONTAINER_NAME_RE_CHARS(first, true) && chars.all(|c| CONTAINER_NAME_RE_CHARS(c, false)),
        None => false,
    };
    if !ok {
        return Err(EngineError::InvalidConfig {
            message: format!(
                "container name '{name}' must match ^[A-Za-z0-9][A-Za-z0-9_.-]*$"
            ),
        });
    }
    Ok(())
}

fn validate_namespace(namespace: &str) -> EngineResult<()> {
    let mut chars = namespace.chars();
    let ok = match chars.next() {
        Some(first) => first.is_ascii_uppercase()
            && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '%'),
        None => false,
    };
    if !ok {
        return Err(EngineError::InvalidConfig {
            message: format!("namespace '{namespace}' must match ^[A-Z][A-Z0-9%]*$"),
        });
    }
    Ok(())
}

fn validate_port(port: u16, field: &str) -> EngineResult<()> {
    if !(1024..=65535).contains(&port) {
        return Err(EngineError::InvalidConfig {
            message: format!("{field} {port} must be in range 1024-65535"),
        });
    }
    Ok(())
}

/// Immutable, validated configuration for one container. Constructed once
/// per operation via [`ContainerConfig::validate`]; never mutated afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Which publishing edition to run.
    pub edition: Edition,
    /// Container name, matches `^[A-Za-z0-9][A-Za-z0-9_.-]*$`.
    pub container_name: String,
    /// Database server port, 1024-65535.
    pub primary_port: u16,
    /// Management HTTP port, 1024-65535.
    pub web_port: u16,
    /// Default namespace, matches `^[A-Z][A-Z0-9%]*$`.
    pub namespace: String,
    /// Admin/system account password.
    pub password: String,
    /// Username remediation operates against.
    pub username: String,
    /// Required when `edition == Enterprise`.
    pub license_key: Option<String>,
    /// Volume mounts to apply at create time, in order.
    pub volumes: Vec<VolumeMount>,
    /// Image tag, e.g. `latest`.
    pub image_tag: String,
    /// Recorded config-file path, or `None` for the literal `default`.
    pub config_source: Option<PathBuf>,
}

impl ContainerConfig {
    /// Construct a config with spec-mandated defaults and the given edition,
    /// then validate it.
    pub fn new(edition: Edition) -> Self {
        Self {
            edition,
            container_name: "iris_db".to_string(),
            primary_port: 1972,
            web_port: 52773,
            namespace: "USER".to_string(),
            password: "SYS".to_string(),
            username: "_SYSTEM".to_string(),
            license_key: None,
            volumes: Vec::new(),
            image_tag: "latest".to_string(),
            config_source: None,
        }
    }

    /// Validate every field. Must be called, and must succeed, before any
    /// external effect is attempted.
    pub fn validate(&self) -> EngineResult<()> {
        validate_container_name(&self.container_name)?;
        validate_namespace(&self.namespace)?;
        validate_port(self.primary_port, "primaryPort")?;
        validate_port(self.web_port, "webPort")?;
        if self.password.is_empty() {
            return Err(EngineError::InvalidConfig {
                message: "password must be non-empty".to_string(),
            });
        }
        if self.image_tag.is_empty() {
            return Err(EngineError::InvalidConfig {
                message: "imageTag must be non-empty".to_string(),
            });
        }
        if self.edition == Edition::Enterprise
            && self.license_key.as_deref().unwrap_or("").is_empty()
        {
            return Err(EngineError::InvalidConfig {
                message: "licenseKey is required when edition=enterprise".to_string(),
            });
        }
        for mount in &self.volumes {
            if !mount.container_path.starts_with('/') {
                return Err(EngineError::InvalidMount {
                    spec: mount.to_docker_spec(),
                    reason: "container-side path must be absolute".to_string(),
                });
            }
        }
        Ok(())
    }

    /// `primaryPort` differs from the spec default, i.e. the caller expressed
    /// a preference `PortRegistry::assign` must honor exactly or reject.
    #[must_use]
    pub fn has_non_default_primary_port(&self) -> bool {
        self.primary_port != Self::new(self.edition).primary_port
    }
}

/// Observed phase of a container, independent of health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerPhase {
    /// No container by this name exists.
    Absent,
    /// `CreateContainer` has been called but `StartContainer` has not completed.
    Creating,
    /// The container is running.
    Running,
    /// The container exists but is not running.
    Stopped,
    /// `RemoveContainer` is in flight.
    Removing,
}

/// Lifecycle-level health label, distinct from the three-level probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLabel {
    /// No probe has run yet this operation.
    Unknown,
    /// A probe is in progress.
    Starting,
    /// `HealthChecker::validate(Full)` has succeeded.
    Healthy,
    /// A probe at some level failed.
    Unhealthy,
}

/// A read-through projection of observed Docker truth. Never cached across
/// operation boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Full engine identifier, absent if the container does not exist.
    pub container_id: Option<ContainerId>,
    /// Mirrors the config's container name.
    pub container_name: String,
    /// Current phase.
    pub phase: ContainerPhase,
    /// Current lifecycle-level health label.
    pub health: HealthLabel,
    /// When the container was created.
    pub created_at: Option<DateTime<Utc>>,
    /// When the container most recently started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the container most recently stopped.
    pub finished_at: Option<DateTime<Utc>>,
    /// Container-internal port -> host-bound port.
    pub ports: std::collections::BTreeMap<u16, u16>,
    /// Resolved image reference.
    pub image: String,
    /// Config-file path recorded in labels at creation, if any.
    pub config_source: Option<String>,
}

impl ContainerState {
    /// The canonical `absent` projection for a name Docker does not know about.
    #[must_use]
    pub fn absent(container_name: impl Into<String>) -> Self {
        Self {
            container_id: None,
            container_name: container_name.into(),
            phase: ContainerPhase::Absent,
            health: HealthLabel::Unknown,
            created_at: None,
            started_at: None,
            finished_at: None,
            ports: std::collections::BTreeMap::new(),
            image: String::new(),
            config_source: None,
        }
    }

    /// Whether this state upholds the spec's `running` invariant: an id and
    /// a start time with `started_at >= created_at`.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        if self.phase != ContainerPhase::Running {
            return true;
        }
        match (self.container_id.as_ref(), self.started_at, self.created_at) {
            (Some(_), Some(started), Some(created)) => started >= created,
            (Some(_), Some(_), None) => true,
            _ => false,
        }
    }
}

/// Kind of a port assignment: automatically chosen from the managed range,
/// or pinned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentKind {
    /// Chosen by the registry from the managed range.
    Auto,
    /// Pinned to a caller-supplied port, possibly outside the managed range.
    Manual,
}

/// Lifecycle status of a persisted port assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    /// Holding its port; conflicts with any other active record on the same port.
    Active,
    /// Explicitly released; eligible for eviction.
    Released,
    /// Reconciled against Docker and found to reference nothing; eligible for eviction.
    Stale,
}

/// One persisted port-to-project reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    /// Absolute, normalized path acting as the record's primary key.
    pub project_path: PathBuf,
    /// The reserved host port.
    pub port: u16,
    /// When the assignment was created.
    pub assigned_at: DateTime<Utc>,
    /// Auto or manual.
    pub kind: AssignmentKind,
    /// Active, released, or stale.
    pub status: AssignmentStatus,
    /// Back-reference used for staleness detection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

/// The persisted envelope, the only unit of atomic rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRegistryFile {
    /// Schema version; the only value this crate writes or accepts is `"1.0"`.
    pub schema_version: String,
    /// Set once, on first write.
    pub created_at: DateTime<Utc>,
    /// All assignments, of any status.
    pub assignments: Vec<PortAssignment>,
}

impl PortRegistryFile {
    /// Current schema version this crate writes.
    pub const CURRENT_SCHEMA_VERSION: &'static str = "1.0";

    /// A fresh, empty envelope stamped with the given creation time.
    #[must_use]
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: Self::CURRENT_SCHEMA_VERSION.to_string(),
            created_at,
            assignments: Vec::new(),
        }
    }
}

/// Normalize a project path to the absolute, canonical form the registry
/// keys on. Does not require the path to exist.
pub fn normalize_project_path(path: &Path) -> EngineResult<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|source| EngineError::Io {
                operation: "resolve current directory".to_string(),
                source,
            })?
            .join(path)
    };
    // Lexical normalization; avoid canonicalize() so a not-yet-existing
    // project directory can still be assigned a port.
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Probe depth for [`crate::health::HealthChecker::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    /// `InspectContainer` reports `phase=running`. Nothing else.
    Minimal,
    /// Minimal, plus `ExecInContainer(['true'])` exits 0.
    Standard,
    /// Standard, plus a database-level liveness probe.
    Full,
}

impl HealthLevel {
    /// Maximum time this level is allotted before returning `unhealthy`.
    #[must_use]
    pub fn budget(self) -> std::time::Duration {
        match self {
            Self::Minimal => std::time::Duration::from_millis(500),
            Self::Standard => std::time::Duration::from_millis(1_000),
            Self::Full => std::time::Duration::from_millis(2_000),
        }
    }

    /// The levels from `Minimal` up to and including `self`, in probe order.
    #[must_use]
    pub fn ascending_through(self) -> &'static [HealthLevel] {
        match self {
            Self::Minimal => &[Self::Minimal],
            Self::Standard => &[Self::Minimal, Self::Standard],
            Self::Full => &[Self::Minimal, Self::Standard, Self::Full],
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimal => f.write_str("minimal"),
            Self::Standard => f.write_str("standard"),
            Self::Full => f.write_str("full"),
        }
    }
}

/// Closed status set a health probe can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    /// The requested level succeeded.
    Healthy,
    /// `phase=running` but a higher-level probe failed.
    RunningNotAccessible,
    /// The container exists but `phase != running`.
    NotRunning,
    /// The container name is not known to Docker.
    NotFound,
    /// The container existed earlier in this process but no longer resolves.
    StaleReference,
    /// The Docker engine itself is unreachable.
    EngineError,
}

/// Result of one [`crate::health::HealthChecker::validate`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// The verdict.
    pub status: HealthStatus,
    /// The level that produced this verdict.
    pub level: HealthLevel,
    /// When the probe completed.
    pub observed_at: DateTime<Utc>,
    /// Total wall-clock time spent probing, in milliseconds.
    pub latency_ms: u64,
    /// A renderable diagnostic, present when `status != Healthy`.
    pub detail: Option<String>,
}

impl HealthCheckResult {
    /// Construct a `healthy` result.
    #[must_use]
    pub fn healthy(level: HealthLevel, latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            level,
            observed_at: Utc::now(),
            latency_ms,
            detail: None,
        }
    }

    /// Construct a non-healthy result with a renderable detail.
    #[must_use]
    pub fn failure(status: HealthStatus, level: HealthLevel, latency_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            status,
            level,
            observed_at: Utc::now(),
            latency_ms,
            detail: Some(detail.into()),
        }
    }

    /// Whether this result counts as healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Ephemeral progress event emitted by [`crate::lifecycle::ContainerLifecycle`].
/// The core never formats these for a terminal; that is the UI layer's job.
#[derive(Debug, Clone)]
pub enum Progress {
    /// A major step began.
    Step {
        /// Human-readable description of the step.
        message: String,
    },
    /// A minor step within the current major step began.
    SubStep {
        /// Human-readable description.
        message: String,
    },
    /// An operation completed successfully.
    Success {
        /// Human-readable description.
        message: String,
    },
    /// A non-fatal condition worth surfacing.
    Warning {
        /// Human-readable description.
        message: String,
        /// The underlying cause, if any.
        cause: Option<String>,
    },
    /// An operation failed.
    Error {
        /// The structured diagnostic describing the failure.
        diagnostic: crate::errors::Diagnostic,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_validation() {
        assert!(validate_container_name("iris_db").is_ok());
        assert!(validate_container_name("iris-db.1").is_ok());
        assert!(validate_container_name("_leading_underscore").is_err());
        assert!(validate_container_name("").is_err());
    }

    #[test]
    fn namespace_validation() {
        assert!(validate_namespace("USER").is_ok());
        assert!(validate_namespace("USER%1").is_ok());
        assert!(validate_namespace("user").is_err());
        assert!(validate_namespace("1USER").is_err());
    }

    #[test]
    fn enterprise_requires_license_key() {
        let mut config = ContainerConfig::new(Edition::Enterprise);
        assert!(config.validate().is_err());
        config.license_key = Some("key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn community_default_validates() {
        let config = ContainerConfig::new(Edition::Community);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_relative_container_mount_path() {
        let mut config = ContainerConfig::new(Edition::Community);
        config.volumes.push(VolumeMount {
            host_path: PathBuf::from("/tmp/data"),
            container_path: "relative/path".to_string(),
            mode: MountMode::Rw,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn read_only_mount_renders_the_ro_docker_flag() {
        let mount = VolumeMount {
            host_path: PathBuf::from("/host/data"),
            container_path: "/container/data".to_string(),
            mode: MountMode::Ro,
        };
        assert_eq!(mount.to_docker_spec(), "/host/data:/container/data:ro");
    }

    #[test]
    fn read_write_mount_renders_the_rw_docker_flag() {
        let mount = VolumeMount {
            host_path: PathBuf::from("/host/data"),
            container_path: "/container/data".to_string(),
            mode: MountMode::Rw,
        };
        assert_eq!(mount.to_docker_spec(), "/host/data:/container/data:rw");
    }

    #[test]
    fn normalize_strips_parent_and_current_components() {
        let normalized = normalize_project_path(Path::new("/tmp/a/../b/./c")).unwrap();
        assert_eq!(normalized, PathBuf::from("/tmp/b/c"));
    }

    #[test]
    fn container_state_running_requires_id_and_ordering() {
        let mut state = ContainerState::absent("iris_db");
        state.phase = ContainerPhase::Running;
        assert!(!state.is_well_formed());

        state.container_id = Some(ContainerId::new("a".repeat(12)).unwrap());
        state.created_at = Some(Utc::now());
        state.started_at = Some(Utc::now());
        assert!(state.is_well_formed());
    }

    proptest::proptest! {
        #[test]
        fn valid_container_names_never_error(name in "[A-Za-z0-9][A-Za-z0-9_.-]{0,40}") {
            proptest::prop_assert!(validate_container_name(&name).is_ok());
        }

        #[test]
        fn names_starting_with_punctuation_always_error(name in "[_.-][A-Za-z0-9_.-]{0,40}") {
            proptest::prop_assert!(validate_container_name(&name).is_err());
        }

        #[test]
        fn valid_namespaces_never_error(namespace in "[A-Z][A-Z0-9%]{0,20}") {
            proptest::prop_assert!(validate_namespace(&namespace).is_ok());
        }

        #[test]
        fn normalize_project_path_is_idempotent(segments in proptest::collection::vec("[a-z]{1,8}", 1..6)) {
            let raw: PathBuf = std::iter::once(PathBuf::from("/tmp")).chain(segments.iter().map(PathBuf::from)).collect();
            let once = normalize_project_path(&raw).unwrap();
            let twice = normalize_project_path(&once).unwrap();
            proptest::prop_assert_eq!(once, twice);
        }
    }
}
