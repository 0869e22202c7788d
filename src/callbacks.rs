//! Host callbacks the orchestrator consumes.

use async_trait::async_trait;

use crate::catalog::{DependencySpec, PluginDescriptor};

/// What the host is asked to confirm before a transfer starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub id: String,
    pub name: String,
    /// Version that would be installed
    pub version: String,
    /// Version currently installed, for updates
    pub current_version: Option<String>,
    /// Declared archive size in bytes
    pub file_size: Option<u64>,
    /// Dependencies missing from the runtime; empty when all are present
    pub missing: Vec<DependencySpec>,
}

impl ConfirmationRequest {
    pub(crate) fn new(
        descriptor: &PluginDescriptor,
        current_version: Option<String>,
        missing: Vec<DependencySpec>,
    ) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.to_string(),
            current_version,
            file_size: descriptor.file_size,
            missing,
        }
    }

    /// True when confirming would update an existing install.
    pub fn is_update(&self) -> bool {
        self.current_version.is_some()
    }
}

/// Log level passed to [`HostCallbacks::log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Trait for applications to implement custom host callbacks.
#[async_trait]
pub trait HostCallbacks: Send + Sync {
    /// Ask the user whether to proceed. `false` declines the operation.
    async fn confirm(&self, request: &ConfirmationRequest) -> bool;

    /// Whether the host reloads plugins without a restart.
    fn supports_hot_reload(&self) -> bool {
        false
    }

    /// Log a user-facing message.
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!("[host] {}", message),
            LogLevel::Debug => tracing::debug!("[host] {}", message),
            LogLevel::Info => tracing::info!("[host] {}", message),
            LogLevel::Warn => tracing::warn!("[host] {}", message),
            LogLevel::Error => tracing::error!("[host] {}", message),
        }
    }
}

/// Default callbacks: approve every confirmation, no hot reload.
#[derive(Debug, Clone, Default)]
pub struct DefaultCallbacks {
    hot_reload: bool,
}

impl DefaultCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report hot-reload support.
    pub fn with_hot_reload(mut self, hot_reload: bool) -> Self {
        self.hot_reload = hot_reload;
        self
    }
}

#[async_trait]
impl HostCallbacks for DefaultCallbacks {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool {
        tracing::debug!("Auto-confirming {} v{}", request.id, request.version);
        true
    }

    fn supports_hot_reload(&self) -> bool {
        self.hot_reload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_callbacks() {
        let cb = DefaultCallbacks::new();
        let request = ConfirmationRequest {
            id: "text_processor".into(),
            name: "Text Processor".into(),
            version: "1.0.0".into(),
            current_version: None,
            file_size: Some(15360),
            missing: Vec::new(),
        };
        assert!(cb.confirm(&request).await);
        assert!(!cb.supports_hot_reload());
        assert!(!request.is_update());
        assert!(DefaultCallbacks::new().with_hot_reload(true).supports_hot_reload());
    }
}
