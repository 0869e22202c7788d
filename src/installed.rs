//! Installed plugin tracking.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A plugin recorded in the ledger with its files on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPlugin {
    /// Plugin identifier
    pub id: String,
    /// Version installed
    pub version: String,
    /// When the install was finalized
    pub installed_at: DateTime<Utc>,
    /// Installation directory (`<plugins_dir>/<id>`)
    pub path: PathBuf,
    /// Files owned by this plugin, relative to `path`
    pub files: Vec<PathBuf>,
}

impl InstalledPlugin {
    /// Get the plugin ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the plugin version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Absolute paths of the files owned by this plugin.
    pub fn file_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.files.iter().map(|f| self.path.join(f))
    }
}

/// Install status for a plugin identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum InstallStatus {
    /// Not installed
    NotInstalled,
    /// Currently installing or uninstalling
    InProgress,
    /// Installed
    Installed {
        /// Version installed
        version: String,
    },
    /// Update available
    UpdateAvailable {
        /// Current version
        current: String,
        /// Latest version
        latest: String,
    },
}

impl InstallStatus {
    /// Check if installed.
    pub fn is_installed(&self) -> bool {
        matches!(
            self,
            InstallStatus::Installed { .. } | InstallStatus::UpdateAvailable { .. }
        )
    }

    /// Check if an update is available.
    pub fn has_update(&self) -> bool {
        matches!(self, InstallStatus::UpdateAvailable { .. })
    }
}
