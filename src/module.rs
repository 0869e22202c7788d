//! Runtime plugin modules.
//!
//! An installed plugin is exposed to the host UI as a [`PluginModule`]. The
//! contract is versioned and checked when a module is registered, so a
//! module built against another contract is rejected up front instead of
//! failing on first use.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{HostError, Result};

/// Contract version modules must report.
pub const MODULE_CONTRACT_VERSION: u32 = 1;

/// A feature module contributed by a plugin.
pub trait PluginModule: Send + Sync {
    /// Contract version this module implements.
    fn contract_version(&self) -> u32;

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn category(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Panel description handed to the host UI.
    fn render_panel(&self) -> Value;

    /// Settings panel description, if the module has settings.
    fn settings_panel(&self) -> Option<Value> {
        None
    }

    /// Called once after registration.
    fn on_load(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn on_activate(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn on_deactivate(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Snapshot of module state, persisted by the host.
    fn save_state(&self) -> Value {
        Value::Null
    }

    fn restore_state(&mut self, _state: Value) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Registered modules, grouped by category, with at most one active.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn PluginModule>>,
    active: Option<usize>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a module, then run its `on_load` hook.
    pub fn register(&mut self, mut module: Box<dyn PluginModule>) -> Result<()> {
        let name = module.name().trim().to_string();
        let violation = |reason: String| HostError::ContractViolation {
            module: name.clone(),
            reason,
        };

        if module.contract_version() != MODULE_CONTRACT_VERSION {
            return Err(violation(format!(
                "contract version {} (host supports {})",
                module.contract_version(),
                MODULE_CONTRACT_VERSION
            )));
        }
        if name.is_empty() {
            return Err(violation("empty name".into()));
        }
        if module.category().trim().is_empty() {
            return Err(violation("empty category".into()));
        }
        if self.position(&name).is_some() {
            return Err(violation("a module with this name is already registered".into()));
        }

        module.on_load().map_err(|reason| HostError::ModuleHook {
            module: name.clone(),
            reason,
        })?;

        tracing::info!("Registered module {} v{} ({})", name, module.version(), module.category());
        self.modules.push(module);
        Ok(())
    }

    /// Remove a module, deactivating it first if needed.
    pub fn unregister(&mut self, name: &str) -> Result<Box<dyn PluginModule>> {
        let index = self
            .position(name)
            .ok_or_else(|| HostError::PluginNotFound(name.to_string()))?;
        if self.active == Some(index) {
            self.deactivate()?;
        }
        self.active = match self.active {
            Some(a) if a > index => Some(a - 1),
            other => other,
        };
        Ok(self.modules.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<&dyn PluginModule> {
        self.position(name).map(|i| self.modules[i].as_ref())
    }

    /// Module names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Module names by category, each in registration order.
    pub fn by_category(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for module in &self.modules {
            groups.entry(module.category()).or_default().push(module.name());
        }
        groups
    }

    /// Name of the active module.
    pub fn active(&self) -> Option<&str> {
        self.active.map(|i| self.modules[i].name())
    }

    /// Make `name` the active module, deactivating the current one.
    pub fn activate(&mut self, name: &str) -> Result<()> {
        let index = self
            .position(name)
            .ok_or_else(|| HostError::PluginNotFound(name.to_string()))?;
        if self.active == Some(index) {
            return Ok(());
        }
        if let Err(e) = self.deactivate() {
            tracing::warn!("{}", e);
        }

        let module = &mut self.modules[index];
        module.on_activate().map_err(|reason| HostError::ModuleHook {
            module: name.to_string(),
            reason,
        })?;
        self.active = Some(index);
        tracing::debug!("Activated module {}", name);
        Ok(())
    }

    /// Deactivate the active module, if any.
    ///
    /// The module is no longer active even when its hook fails.
    pub fn deactivate(&mut self) -> Result<()> {
        let Some(index) = self.active.take() else {
            return Ok(());
        };
        let module = &mut self.modules[index];
        module.on_deactivate().map_err(|reason| HostError::ModuleHook {
            module: module.name().to_string(),
            reason,
        })
    }

    /// Collect every module's state, keyed by name.
    pub fn save_states(&self) -> BTreeMap<String, Value> {
        self.modules
            .iter()
            .map(|m| (m.name().to_string(), m.save_state()))
            .collect()
    }

    /// Hand saved state back to each module present in `states`.
    ///
    /// Every module is attempted; the first failure is returned.
    pub fn restore_states(&mut self, states: &BTreeMap<String, Value>) -> Result<()> {
        let mut first_error = None;
        for module in &mut self.modules {
            let Some(state) = states.get(module.name()) else {
                continue;
            };
            if let Err(reason) = module.restore_state(state.clone()) {
                let err = HostError::ModuleHook {
                    module: module.name().to_string(),
                    reason,
                };
                tracing::warn!("{}", err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.name() == name)
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .field("active", &self.active())
            .finish()
    }
}
