//! Lifecycle orchestrator.
//!
//! [`PluginHost`] coordinates the catalog client, installation store,
//! dependency resolver and transfer engine. Each install or uninstall walks
//! `Checking → {AwaitingConfirmation | Blocked} → Transferring → Finalizing →
//! {Succeeded | Failed}` and reports every transition on the event channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use semver::Version;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::callbacks::{ConfirmationRequest, DefaultCallbacks, HostCallbacks, LogLevel};
use crate::catalog::{Catalog, CatalogClient};
use crate::config::{DependencyPolicy, PluginConfig};
use crate::error::{HostError, Result};
use crate::events::{
    Failure, HostEvent, OperationKind, OperationState, Outcome, EVENT_CHANNEL_CAPACITY,
};
use crate::installed::{InstallStatus, InstalledPlugin};
use crate::reconcile::{reconcile, DisplayRow};
use crate::resolver::{DependencyResolver, RuntimeEnvironment, StaticEnvironment};
use crate::store::InstallationStore;
use crate::transfer::{CancelFlag, TransferEngine};
use crate::version::parse_version;

type ActiveOperations = Mutex<HashMap<String, CancelFlag>>;

/// Main plugin host that manages the plugin lifecycle.
pub struct PluginHost {
    config: PluginConfig,
    host_version: Option<Version>,
    catalog_client: Option<CatalogClient>,
    /// Current snapshot; replaced wholesale on refresh
    catalog: RwLock<Option<Arc<Catalog>>>,
    store: Arc<InstallationStore>,
    resolver: DependencyResolver,
    engine: TransferEngine,
    /// In-flight operations by identifier
    active: ActiveOperations,
    events: broadcast::Sender<HostEvent>,
    callbacks: Arc<dyn HostCallbacks>,
}

/// Admission ticket for one operation on one identifier.
struct Admission<'a> {
    active: &'a ActiveOperations,
    id: String,
    cancel: CancelFlag,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl PluginHost {
    /// Create a new plugin host with default callbacks and an empty runtime
    /// environment.
    ///
    /// Opening the host repairs any state an interrupted operation left in
    /// the plugins directory and clears stale staging content.
    pub fn new(config: PluginConfig) -> Result<Self> {
        config.ensure_dirs()?;

        let host_version = if config.host_version.is_empty() {
            None
        } else {
            let parsed = parse_version(&config.host_version);
            if parsed.is_none() {
                tracing::warn!("Ignoring unparsable host version {}", config.host_version);
            }
            parsed
        };

        let catalog_client = config
            .catalog_url
            .as_ref()
            .map(|url| CatalogClient::new(url, config.request_timeout))
            .transpose()?;

        let store = Arc::new(InstallationStore::open_with_staging(
            config.plugins_dir.clone(),
            Some(config.staging_dir()),
        )?);
        let engine = TransferEngine::new(
            config.staging_dir(),
            config.request_timeout,
            config.size_tolerance,
        )?;
        engine.clear_staging()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!("Plugin host ready at {:?}", config.plugins_dir);
        Ok(Self {
            config,
            host_version,
            catalog_client,
            catalog: RwLock::new(None),
            store,
            resolver: DependencyResolver::new(Arc::new(StaticEnvironment::new())),
            engine,
            active: Mutex::new(HashMap::new()),
            events,
            callbacks: Arc::new(DefaultCallbacks::new()),
        })
    }

    /// Use custom host callbacks.
    pub fn with_callbacks(mut self, callbacks: Arc<dyn HostCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Resolve dependencies against `environment`.
    pub fn with_environment(mut self, environment: Arc<dyn RuntimeEnvironment>) -> Self {
        self.resolver = DependencyResolver::new(environment);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// The installation store.
    pub fn store(&self) -> &Arc<InstallationStore> {
        &self.store
    }

    /// The dependency resolver.
    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Subscribe to progress, state and outcome events.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    // === Catalog ===

    /// Fetch the catalog and replace the current snapshot.
    ///
    /// Install decisions wait while a refresh is running. On failure the
    /// previous snapshot is kept.
    pub async fn refresh_catalog(&self) -> Result<Arc<Catalog>> {
        let client = self.catalog_client.as_ref().ok_or_else(|| HostError::CatalogUnreachable {
            source_location: "<none>".into(),
            reason: "no catalog source configured".into(),
        })?;

        let mut snapshot = self.catalog.write().await;
        match client.fetch().await {
            Ok(catalog) => {
                let catalog = Arc::new(catalog);
                tracing::info!(
                    "Catalog refreshed from {}: {} plugins, {} skipped",
                    client.source(),
                    catalog.len(),
                    catalog.skipped
                );
                self.emit(HostEvent::CatalogRefreshed {
                    plugins: catalog.len(),
                    skipped: catalog.skipped,
                });
                *snapshot = Some(Arc::clone(&catalog));
                Ok(catalog)
            }
            Err(e) => {
                tracing::warn!("Catalog refresh failed: {}", e);
                self.emit(HostEvent::CatalogFailed {
                    failure: Failure::from(&e),
                });
                Err(e)
            }
        }
    }

    /// Replace the catalog snapshot with one obtained elsewhere.
    pub async fn set_catalog(&self, catalog: Catalog) {
        *self.catalog.write().await = Some(Arc::new(catalog));
    }

    /// The current catalog snapshot, if one has been loaded.
    pub async fn catalog(&self) -> Option<Arc<Catalog>> {
        self.catalog.read().await.clone()
    }

    async fn current_catalog(&self) -> Result<Arc<Catalog>> {
        self.catalog
            .read()
            .await
            .clone()
            .ok_or(HostError::CatalogNotLoaded)
    }

    // === Queries ===

    /// Catalog entries merged with installed state, plus local-only plugins.
    pub async fn list_available(&self) -> Result<Vec<DisplayRow>> {
        let catalog = self.current_catalog().await?;
        let installed = self.store.list()?;
        Ok(reconcile(&catalog, &installed, self.host_version.as_ref()))
    }

    /// Installed plugins, sorted by identifier.
    pub fn list_installed(&self) -> Result<Vec<InstalledPlugin>> {
        self.store.list()
    }

    /// Install status of `id`.
    pub async fn install_status(&self, id: &str) -> Result<InstallStatus> {
        if self.is_busy(id) {
            return Ok(InstallStatus::InProgress);
        }
        let Some(local) = self.store.get(id)? else {
            return Ok(InstallStatus::NotInstalled);
        };
        let latest = self
            .catalog
            .read()
            .await
            .as_ref()
            .and_then(|c| c.get(id).map(|d| d.version.clone()));
        let outdated = match (&latest, parse_version(&local.version)) {
            (Some(latest), Some(current)) => current < *latest,
            _ => false,
        };
        Ok(match latest {
            Some(latest) if outdated => InstallStatus::UpdateAvailable {
                current: local.version,
                latest: latest.to_string(),
            },
            _ => InstallStatus::Installed {
                version: local.version,
            },
        })
    }

    /// Check if an operation for `id` is in flight.
    pub fn is_busy(&self, id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    // === Operations ===

    /// Install or update `id` from the current catalog.
    pub async fn install(&self, id: &str) -> Result<Outcome> {
        let admission = self.admit(id)?;
        let result = self.run_install(id, &admission.cancel).await;
        self.finish(id, OperationKind::Install, &result);
        result
    }

    /// Remove `id`'s files and ledger record.
    pub async fn uninstall(&self, id: &str) -> Result<Outcome> {
        let admission = self.admit(id)?;
        let result = self.run_uninstall(id, &admission.cancel).await;
        self.finish(id, OperationKind::Uninstall, &result);
        result
    }

    /// Request cancellation of the operation on `id`.
    ///
    /// Honored while checking, awaiting confirmation or transferring. Once
    /// finalize has started the operation completes or rolls back. Returns
    /// false when nothing is running for `id`.
    pub fn cancel(&self, id: &str) -> bool {
        match self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            Some(flag) => {
                tracing::info!("Cancellation requested for {}", id);
                flag.cancel();
                true
            }
            None => false,
        }
    }

    /// Run [`install`](Self::install) on the runtime.
    pub fn spawn_install(self: &Arc<Self>, id: impl Into<String>) -> JoinHandle<Result<Outcome>> {
        let host = Arc::clone(self);
        let id = id.into();
        tokio::spawn(async move { host.install(&id).await })
    }

    /// Run [`uninstall`](Self::uninstall) on the runtime.
    pub fn spawn_uninstall(self: &Arc<Self>, id: impl Into<String>) -> JoinHandle<Result<Outcome>> {
        let host = Arc::clone(self);
        let id = id.into();
        tokio::spawn(async move { host.uninstall(&id).await })
    }

    /// Run [`refresh_catalog`](Self::refresh_catalog) on the runtime.
    pub fn spawn_refresh(self: &Arc<Self>) -> JoinHandle<Result<Arc<Catalog>>> {
        let host = Arc::clone(self);
        tokio::spawn(async move { host.refresh_catalog().await })
    }

    async fn run_install(&self, id: &str, cancel: &CancelFlag) -> Result<Outcome> {
        self.set_state(id, OperationKind::Install, OperationState::Checking);

        let catalog = self.current_catalog().await?;
        let descriptor = catalog
            .get(id)
            .cloned()
            .ok_or_else(|| HostError::PluginNotFound(id.to_string()))?;

        let current = self.store.get(id)?;
        if let Some(local) = &current {
            if parse_version(&local.version).is_some_and(|v| v >= descriptor.version) {
                tracing::info!("{} v{} already up to date", id, local.version);
                return Ok(Outcome::AlreadyUpToDate {
                    id: id.to_string(),
                    version: local.version.clone(),
                });
            }
        }

        if !descriptor.is_compatible_with(self.host_version.as_ref()) {
            return Err(HostError::IncompatibleHost {
                plugin: id.to_string(),
                required: descriptor
                    .min_app_version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                actual: self.config.host_version.clone(),
            });
        }

        let resolution = self.resolver.resolve(&descriptor);
        let missing = resolution.missing_list();
        if !missing.is_empty() {
            self.emit(HostEvent::DependencyMissing {
                id: id.to_string(),
                missing: missing.clone(),
            });
            let listed: Vec<String> = missing.iter().map(|d| d.to_string()).collect();
            self.callbacks.log(
                LogLevel::Warn,
                &format!("{} needs missing dependencies: {}", id, listed.join(", ")),
            );
            if self.config.dependency_policy == DependencyPolicy::Refuse {
                return Err(HostError::DependencyMissing {
                    plugin: id.to_string(),
                    missing,
                });
            }
        }

        let needs_confirmation = self.config.confirm_installs
            || (!missing.is_empty() && self.config.dependency_policy == DependencyPolicy::Confirm);
        if needs_confirmation {
            self.set_state(id, OperationKind::Install, OperationState::AwaitingConfirmation);
            let request = ConfirmationRequest::new(
                &descriptor,
                current.as_ref().map(|p| p.version.clone()),
                missing,
            );
            if !self.callbacks.confirm(&request).await {
                tracing::info!("Install of {} declined", id);
                return Ok(Outcome::Declined { id: id.to_string() });
            }
        }
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled(id.to_string()));
        }

        self.set_state(id, OperationKind::Install, OperationState::Transferring);
        let staged = self
            .engine
            .prepare(&descriptor, cancel, |progress| {
                self.emit(HostEvent::Progress {
                    id: id.to_string(),
                    progress,
                })
            })
            .await?;

        // Cancellation is not honored past this point
        self.set_state(id, OperationKind::Install, OperationState::Finalizing);
        let plugin = self.engine.finalize(staged, &self.store).await?;

        Ok(Outcome::Installed {
            plugin,
            restart_required: !self.callbacks.supports_hot_reload(),
        })
    }

    async fn run_uninstall(&self, id: &str, cancel: &CancelFlag) -> Result<Outcome> {
        self.set_state(id, OperationKind::Uninstall, OperationState::Checking);
        if !self.store.is_installed(id) {
            return Err(HostError::NotInstalled(id.to_string()));
        }
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled(id.to_string()));
        }

        self.set_state(id, OperationKind::Uninstall, OperationState::Finalizing);
        self.engine.uninstall(id, &self.store).await?;

        Ok(Outcome::Uninstalled {
            id: id.to_string(),
            restart_required: !self.callbacks.supports_hot_reload(),
        })
    }

    // === Bookkeeping ===

    fn admit(&self, id: &str) -> Result<Admission<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(id) {
            tracing::debug!("Rejecting second operation for {}", id);
            return Err(HostError::OperationInProgress(id.to_string()));
        }
        let cancel = CancelFlag::new();
        active.insert(id.to_string(), cancel.clone());
        Ok(Admission {
            active: &self.active,
            id: id.to_string(),
            cancel,
        })
    }

    fn finish(&self, id: &str, operation: OperationKind, result: &Result<Outcome>) {
        match result {
            Ok(outcome) => {
                let state = match outcome {
                    Outcome::Declined { .. } => OperationState::Idle,
                    _ => OperationState::Succeeded,
                };
                self.set_state(id, operation, state);
                self.emit(HostEvent::Completed {
                    id: id.to_string(),
                    outcome: outcome.clone(),
                });
            }
            Err(e) => {
                let state = match e {
                    HostError::DependencyMissing { .. } => OperationState::Blocked,
                    _ => OperationState::Failed,
                };
                tracing::warn!("{:?} of {} failed: {}", operation, id, e);
                self.set_state(id, operation, state);
                self.emit(HostEvent::Failed {
                    id: id.to_string(),
                    operation,
                    failure: Failure::from(e),
                });
            }
        }
    }

    fn set_state(&self, id: &str, operation: OperationKind, state: OperationState) {
        tracing::debug!("{} {:?}: {:?}", id, operation, state);
        self.emit(HostEvent::StateChanged {
            id: id.to_string(),
            operation,
            state,
        });
    }

    fn emit(&self, event: HostEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins_dir", &self.config.plugins_dir)
            .field("host_version", &self.host_version)
            .finish_non_exhaustive()
    }
}
