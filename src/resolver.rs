//! Dependency resolution against the host runtime.
//!
//! The resolver only classifies; it never installs anything and never
//! mutates state. Whether missing dependencies block an install is decided
//! by the host's [`DependencyPolicy`](crate::DependencyPolicy).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use semver::Version;

use crate::catalog::{normalize_package_name, DependencySpec, PluginDescriptor};
use crate::error::{HostError, Result};
use crate::version::parse_version;

/// Source of truth for which libraries the host runtime provides.
pub trait RuntimeEnvironment: Send + Sync {
    /// Version of `package` available to plugins, or `None` if absent.
    ///
    /// `package` is already normalized (lowercase, `_` for `-`).
    fn available_version(&self, package: &str) -> Option<Version>;
}

/// A fixed table of available packages.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    packages: BTreeMap<String, Version>,
}

impl StaticEnvironment {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package. Unparsable versions are ignored with a warning.
    pub fn with_package(mut self, name: &str, version: &str) -> Self {
        self.insert(name, version);
        self
    }

    /// Add or replace a package.
    pub fn insert(&mut self, name: &str, version: &str) {
        match parse_version(version) {
            Some(v) => {
                self.packages.insert(normalize_package_name(name), v);
            }
            None => tracing::warn!("Ignoring package {} with unparsable version {}", name, version),
        }
    }

    /// Load a `{"package": "version", ...}` JSON table, as exported by the
    /// host's packaging step.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let table: BTreeMap<String, String> = serde_json::from_slice(&bytes).map_err(|e| {
            HostError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {}", path.display(), e),
            ))
        })?;
        let mut env = Self::new();
        for (name, version) in &table {
            env.insert(name, version);
        }
        Ok(env)
    }
}

impl RuntimeEnvironment for StaticEnvironment {
    fn available_version(&self, package: &str) -> Option<Version> {
        self.packages.get(package).cloned()
    }
}

/// Outcome of resolving a descriptor's dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub satisfied: BTreeSet<DependencySpec>,
    pub missing: BTreeSet<DependencySpec>,
}

impl Resolution {
    /// True when nothing is missing.
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty()
    }

    /// Missing dependencies in stable order.
    pub fn missing_list(&self) -> Vec<DependencySpec> {
        self.missing.iter().cloned().collect()
    }
}

/// Classifies a descriptor's dependencies as satisfied or missing.
#[derive(Clone)]
pub struct DependencyResolver {
    environment: Arc<dyn RuntimeEnvironment>,
}

impl DependencyResolver {
    /// Create a resolver over a runtime environment.
    pub fn new(environment: Arc<dyn RuntimeEnvironment>) -> Self {
        Self { environment }
    }

    /// Resolve every dependency of `descriptor`.
    ///
    /// A dependency absent from the runtime, or present below its minimum
    /// version, is missing.
    pub fn resolve(&self, descriptor: &PluginDescriptor) -> Resolution {
        let mut resolution = Resolution::default();
        for spec in &descriptor.dependencies {
            let ok = self
                .environment
                .available_version(&spec.name)
                .is_some_and(|v| spec.constraint.is_satisfied_by(&v));
            if ok {
                resolution.satisfied.insert(spec.clone());
            } else {
                tracing::debug!("{}: dependency {} missing", descriptor.id, spec);
                resolution.missing.insert(spec.clone());
            }
        }
        resolution
    }
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, SourceLocation};

    fn descriptor(deps: &str) -> PluginDescriptor {
        let doc = format!(
            r#"{{"version": "1.0", "plugins": [{{"id": "p", "version": "1.0.0", "url": "p.zip", "dependencies": {}}}]}}"#,
            deps
        );
        let catalog =
            Catalog::parse(doc.as_bytes(), &SourceLocation::File("plugins.json".into())).unwrap();
        catalog.get("p").unwrap().clone()
    }

    fn resolver(env: StaticEnvironment) -> DependencyResolver {
        DependencyResolver::new(Arc::new(env))
    }

    #[test]
    fn test_all_satisfied() {
        let env = StaticEnvironment::new()
            .with_package("pandas", "2.1.0")
            .with_package("openpyxl", "3.1.2");
        let res = resolver(env).resolve(&descriptor(r#"["pandas>=1.3.0", "openpyxl>=3.0.0"]"#));
        assert!(res.is_satisfied());
        assert_eq!(res.satisfied.len(), 2);
    }

    #[test]
    fn test_absent_and_too_old_are_missing() {
        let env = StaticEnvironment::new().with_package("pandas", "1.2.5");
        let res = resolver(env).resolve(&descriptor(r#"["pandas>=1.3.0", "Pillow>=9.0.0"]"#));
        let missing: Vec<String> = res.missing.iter().map(|s| s.to_string()).collect();
        assert_eq!(missing, vec!["pandas>=1.3.0", "pillow>=9.0.0"]);
        assert!(res.satisfied.is_empty());
    }

    #[test]
    fn test_exact_and_any() {
        let env = StaticEnvironment::new()
            .with_package("python-docx", "0.8.11")
            .with_package("openpyxl", "3.1.0");
        let res = resolver(env).resolve(&descriptor(r#"["python_docx", "openpyxl==3.0"]"#));
        assert_eq!(res.satisfied.len(), 1);
        assert_eq!(res.missing.iter().next().unwrap().name, "openpyxl");
    }

    #[test]
    fn test_resolve_is_pure() {
        let r = resolver(StaticEnvironment::new().with_package("pandas", "2.0"));
        let d = descriptor(r#"["pandas>=1.3.0", "pillow>=9.0.0"]"#);
        assert_eq!(r.resolve(&d), r.resolve(&d));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, r#"{"Pillow": "10.0.1", "pandas": "2.2"}"#).unwrap();
        let env = StaticEnvironment::from_json_file(&path).unwrap();
        assert_eq!(env.available_version("pillow"), Some(Version::new(10, 0, 1)));
        assert_eq!(env.available_version("pandas"), Some(Version::new(2, 2, 0)));
    }
}
