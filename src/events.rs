//! Events broadcast from running operations to the host.

use crate::catalog::DependencySpec;
use crate::error::{ErrorKind, HostError};
use crate::installed::InstalledPlugin;
use crate::transfer::Progress;

/// Capacity of the host event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Kind of operation an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Install,
    Uninstall,
}

/// Per-operation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    /// Resolving dependencies and compatibility
    Checking,
    /// Waiting for the host's yes/no decision
    AwaitingConfirmation,
    /// Refused because dependencies are missing
    Blocked,
    /// Downloading and unpacking; cancellable
    Transferring,
    /// Atomic move into place; not cancellable
    Finalizing,
    Succeeded,
    Failed,
}

impl OperationState {
    /// States from which the operation ends and the id returns to `Idle`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Blocked | OperationState::Succeeded | OperationState::Failed
        )
    }
}

/// Result of a completed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Plugin installed or updated
    Installed {
        plugin: InstalledPlugin,
        restart_required: bool,
    },
    /// Same version already installed; nothing done
    AlreadyUpToDate { id: String, version: String },
    /// Plugin removed
    Uninstalled { id: String, restart_required: bool },
    /// Host declined at the confirmation prompt
    Declined { id: String },
}

/// Structured failure carried by events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    pub no_change_made: bool,
}

impl From<&HostError> for Failure {
    fn from(err: &HostError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            no_change_made: err.no_change_made(),
        }
    }
}

/// Event delivered to subscribers of [`PluginHost::subscribe`](crate::PluginHost::subscribe).
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    StateChanged {
        id: String,
        operation: OperationKind,
        state: OperationState,
    },
    Progress {
        id: String,
        progress: Progress,
    },
    /// Dependencies missing; always reported, whatever the policy
    DependencyMissing {
        id: String,
        missing: Vec<DependencySpec>,
    },
    Completed {
        id: String,
        outcome: Outcome,
    },
    Failed {
        id: String,
        operation: OperationKind,
        failure: Failure,
    },
    /// A new catalog snapshot replaced the previous one
    CatalogRefreshed { plugins: usize, skipped: usize },
    CatalogFailed { failure: Failure },
}

impl HostEvent {
    /// Plugin identifier the event refers to; `None` for catalog events.
    pub fn id(&self) -> Option<&str> {
        match self {
            HostEvent::StateChanged { id, .. }
            | HostEvent::Progress { id, .. }
            | HostEvent::DependencyMissing { id, .. }
            | HostEvent::Completed { id, .. }
            | HostEvent::Failed { id, .. } => Some(id),
            HostEvent::CatalogRefreshed { .. } | HostEvent::CatalogFailed { .. } => None,
        }
    }
}
