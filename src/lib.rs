//! Plugin lifecycle manager for WorkTools.
//!
//! Reconciles a remote plugin catalog against local installation state,
//! resolves dependencies, and performs install, update and uninstall
//! transactions that never leave a plugin half installed.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use worktools_plugin_host::{PluginConfig, PluginHost, StaticEnvironment};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PluginConfig::default()
//!         .with_catalog("https://example.com/plugins/plugins.json")
//!         .with_host_version("1.0.0")
//!         .with_env_overrides();
//!
//!     let env = StaticEnvironment::new().with_package("pandas", "2.1.0");
//!     let host = Arc::new(PluginHost::new(config)?.with_environment(Arc::new(env)));
//!
//!     host.refresh_catalog().await?;
//!     for row in host.list_available().await? {
//!         println!("{} {} {:?}", row.id, row.version, row.status);
//!     }
//!
//!     let outcome = host.spawn_install("text_processor").await??;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

mod archive;
mod callbacks;
mod catalog;
mod config;
mod error;
mod events;
mod host;
mod installed;
mod module;
mod reconcile;
mod resolver;
mod store;
mod transfer;
mod version;

pub use archive::{ArchiveError, ArchiveKind};
pub use callbacks::*;
pub use catalog::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use host::*;
pub use installed::*;
pub use module::*;
pub use reconcile::*;
pub use resolver::*;
pub use store::{InstallationStore, RecoveryReport};
pub use transfer::{CancelFlag, Progress, StagedPlugin, TransferEngine};
pub use version::{compare_versions, parse_version};
