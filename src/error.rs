//! Error types for plugin host operations.

use std::fmt;

use thiserror::Error;

use crate::catalog::DependencySpec;

/// Errors that can occur during plugin host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// Catalog transport could not complete (network error, missing file)
    #[error("Catalog unreachable ({source_location}): {reason}")]
    CatalogUnreachable {
        source_location: String,
        reason: String,
    },

    /// Catalog payload could not be parsed into descriptors
    #[error("Catalog malformed: {0}")]
    CatalogMalformed(String),

    /// No catalog has been fetched yet
    #[error("Catalog not loaded; refresh the catalog first")]
    CatalogNotLoaded,

    /// Identifier is not listed in the current catalog
    #[error("Plugin not found in catalog: {0}")]
    PluginNotFound(String),

    /// Required dependencies are absent from the runtime
    #[error("Plugin '{plugin}' has missing dependencies: {}", format_specs(.missing))]
    DependencyMissing {
        plugin: String,
        missing: Vec<DependencySpec>,
    },

    /// Plugin needs a newer host application
    #[error("Plugin '{plugin}' requires host version {required}, running {actual}")]
    IncompatibleHost {
        plugin: String,
        required: String,
        actual: String,
    },

    /// Download or staging IO failed
    #[error("Transfer failed for '{plugin}': {reason}")]
    TransferFailed { plugin: String, reason: String },

    /// Staged archive is not a well-formed plugin archive
    #[error("Invalid archive for '{plugin}': {reason}")]
    ArchiveInvalid { plugin: String, reason: String },

    /// Destination could not be swapped in; the previous state was restored
    #[error("Finalize conflict for '{plugin}': {reason}; no change was made")]
    FinalizeConflict { plugin: String, reason: String },

    /// Plugin not installed
    #[error("Plugin not installed: {0}")]
    NotInstalled(String),

    /// Another operation for the same identifier is in flight
    #[error("Operation already in progress for plugin: {0}")]
    OperationInProgress(String),

    /// Operation cancelled before finalize
    #[error("Operation cancelled for plugin: {0}")]
    Cancelled(String),

    /// Plugin module does not satisfy the host contract
    #[error("Plugin module '{module}' violates the host contract: {reason}")]
    ContractViolation { module: String, reason: String },

    /// Plugin module lifecycle hook failed
    #[error("Plugin module '{module}' hook failed: {reason}")]
    ModuleHook { module: String, reason: String },

    /// Ledger record could not be read or written
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Flat classification of [`HostError`] for hosts that only need the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CatalogUnreachable,
    CatalogMalformed,
    CatalogNotLoaded,
    PluginNotFound,
    DependencyMissing,
    IncompatibleHost,
    TransferFailed,
    ArchiveInvalid,
    FinalizeConflict,
    NotInstalled,
    OperationInProgress,
    Cancelled,
    ContractViolation,
    ModuleHook,
    Ledger,
    Io,
}

impl HostError {
    /// The error kind, without payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::CatalogUnreachable { .. } => ErrorKind::CatalogUnreachable,
            HostError::CatalogMalformed(_) => ErrorKind::CatalogMalformed,
            HostError::CatalogNotLoaded => ErrorKind::CatalogNotLoaded,
            HostError::PluginNotFound(_) => ErrorKind::PluginNotFound,
            HostError::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            HostError::IncompatibleHost { .. } => ErrorKind::IncompatibleHost,
            HostError::TransferFailed { .. } => ErrorKind::TransferFailed,
            HostError::ArchiveInvalid { .. } => ErrorKind::ArchiveInvalid,
            HostError::FinalizeConflict { .. } => ErrorKind::FinalizeConflict,
            HostError::NotInstalled(_) => ErrorKind::NotInstalled,
            HostError::OperationInProgress(_) => ErrorKind::OperationInProgress,
            HostError::Cancelled(_) => ErrorKind::Cancelled,
            HostError::ContractViolation { .. } => ErrorKind::ContractViolation,
            HostError::ModuleHook { .. } => ErrorKind::ModuleHook,
            HostError::Ledger(_) => ErrorKind::Ledger,
            HostError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the installation directory is guaranteed unchanged by the
    /// failed operation.
    ///
    /// Everything raised before finalize starts touches only staging, and a
    /// finalize conflict is only reported after rollback completed.
    pub fn no_change_made(&self) -> bool {
        !matches!(self, HostError::Ledger(_) | HostError::Io(_))
    }

    pub(crate) fn transfer(plugin: &str, reason: impl fmt::Display) -> Self {
        HostError::TransferFailed {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn archive(plugin: &str, reason: impl fmt::Display) -> Self {
        HostError::ArchiveInvalid {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn finalize(plugin: &str, reason: impl fmt::Display) -> Self {
        HostError::FinalizeConflict {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn format_specs(specs: &[DependencySpec]) -> String {
    specs
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for plugin host operations
pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_message() {
        let err = HostError::DependencyMissing {
            plugin: "image_watermark".into(),
            missing: vec![DependencySpec::parse("pillow>=9.0.0").unwrap()],
        };
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
        assert!(err.to_string().contains("pillow>=9.0.0"));
        assert!(err.no_change_made());
    }

    #[test]
    fn test_finalize_conflict_states_no_change() {
        let err = HostError::finalize("text_processor", "destination locked");
        assert_eq!(err.kind(), ErrorKind::FinalizeConflict);
        assert!(err.to_string().contains("no change was made"));
    }

    #[test]
    fn test_io_error_may_have_changed_disk() {
        let err = HostError::from(std::io::Error::other("disk full"));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!err.no_change_made());
    }
}
