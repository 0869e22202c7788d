//! Plugin host configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable a host may apply to override the catalog URL.
pub const ENV_CATALOG_URL: &str = "WORKTOOLS_CATALOG_URL";

/// Environment variable a host may apply to override the plugins directory.
pub const ENV_PLUGINS_DIR: &str = "WORKTOOLS_PLUGINS_DIR";

/// What to do when a plugin's dependencies are missing from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyPolicy {
    /// Stop in `Blocked` and report the missing dependencies
    Refuse,
    /// Report and ask the host for confirmation before transferring
    #[default]
    Confirm,
    /// Report and continue without asking
    WarnAndProceed,
}

/// Configuration for the plugin host.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Directory where plugins are installed
    pub plugins_dir: PathBuf,

    /// Staging directory for downloads and extraction.
    /// `None` = `<plugins_dir>/.staging`, keeping renames on one filesystem.
    pub staging_dir: Option<PathBuf>,

    /// Catalog URL or path (None = no catalog, local only)
    pub catalog_url: Option<String>,

    /// Host application version (for compatibility checks)
    pub host_version: String,

    /// Missing-dependency policy
    pub dependency_policy: DependencyPolicy,

    /// Ask the host to confirm every install, not only those with missing dependencies
    pub confirm_installs: bool,

    /// Allowed relative deviation between declared and downloaded size
    pub size_tolerance: f64,

    /// Network request timeout
    pub request_timeout: Duration,
}

impl PluginConfig {
    /// Create a new configuration rooted at `plugins_dir`.
    pub fn new(plugins_dir: PathBuf) -> Self {
        Self {
            plugins_dir,
            staging_dir: None,
            catalog_url: None,
            host_version: String::new(),
            dependency_policy: DependencyPolicy::default(),
            confirm_installs: false,
            size_tolerance: 0.05,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Set the catalog URL.
    pub fn with_catalog(mut self, url: impl Into<String>) -> Self {
        self.catalog_url = Some(url.into());
        self
    }

    /// Set the host version.
    pub fn with_host_version(mut self, version: impl Into<String>) -> Self {
        self.host_version = version.into();
        self
    }

    /// Set the missing-dependency policy.
    pub fn with_dependency_policy(mut self, policy: DependencyPolicy) -> Self {
        self.dependency_policy = policy;
        self
    }

    /// Require host confirmation for every install.
    pub fn confirm_installs(mut self, confirm: bool) -> Self {
        self.confirm_installs = confirm;
        self
    }

    /// Set the size tolerance (fraction of the declared size).
    pub fn with_size_tolerance(mut self, tolerance: f64) -> Self {
        self.size_tolerance = tolerance.max(0.0);
        self
    }

    /// Use an explicit staging directory.
    ///
    /// A staging directory inside `plugins_dir` is skipped by store recovery.
    pub fn with_staging_dir(mut self, dir: PathBuf) -> Self {
        self.staging_dir = Some(dir);
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Apply `WORKTOOLS_CATALOG_URL` / `WORKTOOLS_PLUGINS_DIR` overrides.
    ///
    /// Only called by hosts that want environment overrides; nothing in the
    /// crate reads the environment on its own.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = std::env::var(ENV_CATALOG_URL).ok().filter(|s| !s.is_empty()) {
            tracing::debug!("Catalog URL overridden from environment: {}", url);
            self.catalog_url = Some(url);
        }
        if let Some(dir) = std::env::var_os(ENV_PLUGINS_DIR).filter(|s| !s.is_empty()) {
            self.plugins_dir = PathBuf::from(dir);
        }
        self
    }

    /// Effective staging directory.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.plugins_dir.join(".staging"))
    }

    /// Ensure directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.plugins_dir)?;
        std::fs::create_dir_all(self.staging_dir())?;
        Ok(())
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        // Windows: %APPDATA%, macOS: Application Support, Linux: ~/.config
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(config_dir.join("WorkTools").join("plugins"))
    }
}
