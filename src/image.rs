//! Maps a publishing edition and image tag to a canonical image reference.
//!
//! The one non-obvious fact this module encodes: the community and
//! enterprise editions live under different registry namespaces. A mapping
//! that shares one namespace for both will fail with "image not found" at
//! pull time, not at validation time — which is exactly the defect this
//! module exists to prevent.

use crate::types::Edition;

/// Resolves `(edition, tag)` pairs to full image references.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageResolver;

impl ImageResolver {
    /// Build a resolver. Stateless; exists for symmetry with the rest of the
    /// engine's components and to give callers a stable injection point.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolve a full image reference, e.g. `intersystemsdc/iris-community:latest`.
    #[must_use]
    pub fn resolve(&self, edition: Edition, tag: &str) -> String {
        let repository = match edition {
            Edition::Community => "intersystemsdc/iris-community",
            Edition::Enterprise => "intersystems/iris",
        };
        format!("{repository}:{tag}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn community_uses_the_dc_namespace() {
        let resolved = ImageResolver::new().resolve(Edition::Community, "latest");
        assert_eq!(resolved, "intersystemsdc/iris-community:latest");
    }

    #[test]
    fn enterprise_uses_the_intersystems_namespace() {
        let resolved = ImageResolver::new().resolve(Edition::Enterprise, "2024.1");
        assert_eq!(resolved, "intersystems/iris:2024.1");
    }

    #[test]
    fn editions_never_share_a_repository() {
        let resolver = ImageResolver::new();
        assert_ne!(
            resolver.resolve(Edition::Community, "latest"),
            resolver.resolve(Edition::Enterprise, "latest")
        );
    }
}
