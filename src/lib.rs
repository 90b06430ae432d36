//! # iris-devtester-engine
//!
//! Container orchestration and coordination engine for InterSystems IRIS
//! developer tooling. Provisions, validates, and coordinates IRIS Docker
//! containers across concurrent callers on one host.
//!
//! This crate is the core engine only: CLI argument parsing, terminal
//! rendering, config-file loading, and the fixture export/import subsystem
//! are external collaborators that consume the surface this crate exposes.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iris_devtester_engine::gateway::CliDockerGateway;
//! use iris_devtester_engine::lifecycle::{CancellationToken, ContainerLifecycle};
//! use iris_devtester_engine::port_registry::{PortRegistry, PortRegistryConfig};
//! use iris_devtester_engine::types::{ContainerConfig, Edition};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), iris_devtester_engine::errors::EngineError> {
//!     let gateway = Arc::new(CliDockerGateway::discover()?);
//!     let home = dirs_next_home();
//!     let registry = PortRegistry::new(
//!         PortRegistryConfig::default_for_home(&home),
//!         gateway.clone(),
//!         "iris_",
//!     );
//!     let lifecycle = ContainerLifecycle::new(gateway, registry).await?;
//!
//!     let config = ContainerConfig::new(Edition::Community);
//!     let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
//!     lifecycle
//!         .up(&config, &std::env::current_dir().unwrap(), tx, CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//!
//! fn dirs_next_home() -> std::path::PathBuf {
//!     std::env::var_os("HOME").map(std::path::PathBuf::from).unwrap_or_default()
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`errors`] — the closed error taxonomy and structured diagnostics.
//! - [`types`] — validated configuration, observed state, port assignments, health results.
//! - [`executor`] — low-level async `docker` process execution.
//! - [`gateway`] — `DockerGateway`, the typed seam over the Docker engine.
//! - [`image`] — edition-to-image-reference resolution.
//! - [`port_registry`] — cross-process port arbitration.
//! - [`health`] — layered readiness probing with a TTL cache.
//! - [`remediate`] — bounded-retry in-container admin remediation.
//! - [`lifecycle`] — `ContainerLifecycle`, the top-level orchestrator.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use errors::{EngineError, EngineResult};
pub use gateway::{CliDockerGateway, DockerGateway, MockDockerGateway};
pub use health::HealthChecker;
pub use image::ImageResolver;
pub use lifecycle::{CancellationToken, ContainerLifecycle, OperationOutcome, StatusView};
pub use port_registry::{PortRegistry, PortRegistryConfig};
pub use remediate::Remediator;
pub use types::{ContainerConfig, ContainerId, ContainerState, Edition, HealthLevel, Progress};

pub mod errors;
pub mod executor;
pub mod gateway;
pub mod health;
pub mod image;
pub mod lifecycle;
pub mod port_registry;
pub mod remediate;
pub mod types;

/// The version of this crate, also stamped into the `iris-devtester.version`
/// container label at create time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
