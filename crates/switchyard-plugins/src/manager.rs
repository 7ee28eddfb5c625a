//! Plugin lifecycle coordination.
//!
//! [`PluginManager`] is the only component the host talks to. It owns the
//! loaded-plugin map, the ordered enabled set, and one [`PluginContext`] per
//! loaded id, and it drives the validator, loader, sandbox, and registry.
//!
//! ```text
//! unloaded --load--> loaded --enable--> enabled
//!                      ^  <--disable--     |
//!                      |                   |
//!   unloaded <--uninstall (disables first)-+
//! ```
//!
//! Lifecycle transitions serialize on an internal mutex. Task hooks are
//! dispatched to enabled plugins one at a time, in enable order, and a
//! failing plugin never stops the others.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use switchyard_config::{Config, PermissionPolicy};
use switchyard_events::{EventBus, EventMetadata, SwitchyardEvent};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::context::{PluginContext, TaskApi, UnavailableTaskApi};
use crate::error::{PluginError, PluginResult};
use crate::loader::{BuiltinFactory, LoadedPlugin, PluginLoader};
use crate::manifest::{self, PluginManifest};
use crate::plugin::{LifecycleEvent, Plugin, PluginId, TaskHook};
use crate::registry::{PluginRegistry, PluginRegistryUpdate};
use crate::sandbox::{Sandbox, SandboxLimits, SandboxOptions};
use crate::validator;

const EVENT_SOURCE: &str = "plugin-manager";

/// Settings for a [`PluginManager`].
#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    /// Plugins root.
    pub root: PathBuf,
    /// Ids loaded on the trusted path.
    pub trusted: Vec<String>,
    /// Permission classes the host grants at all.
    pub policy: PermissionPolicy,
    /// Sandbox quotas.
    pub limits: SandboxLimits,
    /// Per-plugin limit for one hook call.
    pub hook_timeout: Option<Duration>,
    /// Re-enable plugins the registry marks enabled after a batch load.
    pub restore_enabled: bool,
    /// Environment offered to plugins. `None` reads the process
    /// environment. Untrusted plugins only see the names they declare.
    pub env: Option<HashMap<String, String>>,
}

impl PluginManagerConfig {
    /// Defaults for `root`: nothing trusted, default policy and quotas,
    /// a 10 s hook timeout, restore on.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            trusted: Vec::new(),
            policy: PermissionPolicy::default(),
            limits: SandboxLimits::default(),
            hook_timeout: Some(Duration::from_secs(10)),
            restore_enabled: true,
            env: None,
        }
    }

    /// Derive settings from the host configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let hook_timeout =
            (config.hooks.timeout_ms > 0).then(|| Duration::from_millis(config.hooks.timeout_ms));
        Self {
            root: config.plugins_root(),
            trusted: config.plugins.trusted.clone(),
            policy: config.permissions,
            limits: SandboxLimits::from_section(&config.sandbox),
            hook_timeout,
            restore_enabled: config.plugins.restore_enabled,
            env: None,
        }
    }

    /// Trust the given ids.
    #[must_use]
    pub fn trusted<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Replace the permission policy.
    #[must_use]
    pub fn policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set or clear the hook timeout.
    #[must_use]
    pub fn hook_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hook_timeout = timeout;
        self
    }

    /// Toggle restoring enabled state after a batch load.
    #[must_use]
    pub fn restore_enabled(mut self, restore: bool) -> Self {
        self.restore_enabled = restore;
        self
    }

    /// Offer plugins a fixed environment instead of the process one.
    #[must_use]
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        );
        self
    }

    fn is_trusted(&self, id: &str) -> bool {
        self.trusted.iter().any(|t| t == id)
    }

    /// Environment for one plugin's sandbox context.
    fn plugin_env(&self, manifest: &PluginManifest, trusted: bool) -> HashMap<String, String> {
        let permissions = manifest.permissions_or_default();
        let declared = permissions.env_vars();
        match &self.env {
            Some(env) => env
                .iter()
                .filter(|(name, _)| trusted || declared.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            None if trusted => std::env::vars_os()
                .filter_map(|(name, value)| {
                    Some((name.into_string().ok()?, value.into_string().ok()?))
                })
                .collect(),
            None => declared
                .iter()
                .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
                .collect(),
        }
    }
}

/// One plugin's answer to a task hook.
#[derive(Debug)]
pub struct HookOutcome {
    /// The plugin that was called.
    pub plugin_id: PluginId,
    /// Its return value, or a [`PluginError::HookFailed`].
    pub result: PluginResult<Value>,
}

impl HookOutcome {
    /// Whether the call succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// The return value, if the call succeeded.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }
}

/// Result of [`PluginManager::load_all_plugins`].
#[derive(Debug, Default)]
pub struct LoadSummary {
    /// Newly loaded plugins, in discovery order.
    pub loaded: Vec<PluginId>,
    /// Directories that failed to load.
    pub failed: Vec<(PathBuf, PluginError)>,
    /// Plugins re-enabled from the registry.
    pub restored: Vec<PluginId>,
}

struct ManagedPlugin {
    loaded: LoadedPlugin,
    context: PluginContext,
}

/// Coordinates validation, loading, lifecycle, and hook dispatch.
pub struct PluginManager {
    config: PluginManagerConfig,
    bus: EventBus,
    tasks: Arc<dyn TaskApi>,
    sandbox: Arc<Sandbox>,
    loader: PluginLoader,
    registry: PluginRegistry,
    plugins: RwLock<HashMap<String, Arc<ManagedPlugin>>>,
    enabled: RwLock<Vec<String>>,
    lifecycle: Mutex<()>,
}

impl PluginManager {
    /// Create a manager. Nothing is read from disk until a load.
    #[must_use]
    pub fn new(config: PluginManagerConfig, bus: EventBus) -> Self {
        let sandbox = Arc::new(Sandbox::new(config.limits));
        Self {
            loader: PluginLoader::new(Arc::clone(&sandbox)),
            registry: PluginRegistry::new(&config.root),
            tasks: Arc::new(UnavailableTaskApi),
            plugins: RwLock::new(HashMap::new()),
            enabled: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
            sandbox,
            config,
            bus,
        }
    }

    /// Give plugins a real task API.
    #[must_use]
    pub fn with_task_api(mut self, tasks: Arc<dyn TaskApi>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Make `builtin:<name>` resolve to `factory` on the trusted path.
    #[must_use]
    pub fn with_builtin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.register_builtin(name, Arc::new(factory));
        self
    }

    /// Register a builtin plugin factory.
    pub fn register_builtin(&mut self, name: impl Into<String>, factory: BuiltinFactory) {
        self.loader.register_builtin(name, factory);
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &PluginManagerConfig {
        &self.config
    }

    /// The durable catalogue.
    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// The sandbox hosting WASM plugins.
    #[must_use]
    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// The bus notifications are published on.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    fn emit(&self, event: SwitchyardEvent) {
        self.bus.publish(event);
    }

    async fn managed(&self, id: &str) -> PluginResult<Arc<ManagedPlugin>> {
        self.plugins
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::lifecycle(id, "plugin is not loaded"))
    }

    // ---------------------------------------------------------------- loading

    /// Load every plugin under the root.
    ///
    /// Reads the registry, discovers plugin directories, and loads each one
    /// in turn. A failing directory is recorded and skipped. Afterwards, if
    /// enabled, plugins the registry marks enabled are re-enabled.
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry or the root cannot be read.
    pub async fn load_all_plugins(&self) -> PluginResult<LoadSummary> {
        self.registry.load()?;
        let dirs = self.registry.discover_plugins()?;
        info!(root = %self.config.root.display(), count = dirs.len(), "Loading plugins");

        let already: Vec<PathBuf> = self
            .plugins
            .read()
            .await
            .values()
            .map(|m| m.loaded.path.clone())
            .collect();

        let mut summary = LoadSummary::default();
        for dir in dirs {
            if already.contains(&dir) {
                debug!(path = %dir.display(), "Plugin already loaded, skipping");
                continue;
            }
            match self.load_plugin(&dir).await {
                Ok(id) => summary.loaded.push(id),
                Err(e) => summary.failed.push((dir, e)),
            }
        }

        if self.config.restore_enabled {
            for id in &summary.loaded {
                let wanted = self.registry.get(id.as_str()).is_some_and(|e| e.enabled);
                if !wanted {
                    continue;
                }
                match self.enable_plugin(id.as_str()).await {
                    Ok(()) => summary.restored.push(id.clone()),
                    Err(e) => warn!(plugin_id = %id, error = %e, "Failed to restore enabled plugin"),
                }
            }
        }

        info!(
            loaded = summary.loaded.len(),
            failed = summary.failed.len(),
            restored = summary.restored.len(),
            "Plugin loading complete"
        );
        Ok(summary)
    }

    /// Load the plugin in `path`.
    ///
    /// The install hook fires only when the id is new to the registry.
    ///
    /// # Errors
    ///
    /// - [`PluginError::ManifestParseError`] or [`PluginError::ValidationFailed`]
    ///   for a bad manifest or a permission the host policy forbids.
    /// - [`PluginError::Lifecycle`] if the id is already loaded.
    /// - [`PluginError::LoadFailed`] if the entry point cannot be loaded.
    pub async fn load_plugin(&self, path: &Path) -> PluginResult<PluginId> {
        let _guard = self.lifecycle.lock().await;
        match self.load_locked(path).await {
            Ok(id) => Ok(id),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load plugin");
                self.emit(SwitchyardEvent::PluginFailed {
                    metadata: EventMetadata::new(EVENT_SOURCE),
                    path: path.display().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            },
        }
    }

    async fn load_locked(&self, path: &Path) -> PluginResult<PluginId> {
        let manifest = read_validated_manifest(path, &self.config.policy)?;
        let id = PluginId::new(&manifest.metadata.id)?;

        if self.plugins.read().await.contains_key(id.as_str()) {
            return Err(PluginError::lifecycle(id.as_str(), "plugin is already loaded"));
        }

        let trusted = self.config.is_trusted(id.as_str());
        let options = SandboxOptions {
            env: self.config.plugin_env(&manifest, trusted),
            ..SandboxOptions::default()
        };
        let loaded = if trusted {
            self.loader.load(path, &manifest, options).await?
        } else {
            self.loader.load_in_sandbox(path, &manifest, options).await?
        };

        if !PluginLoader::validate_plugin(&loaded) {
            self.sandbox.destroy_context(id.as_str());
            return Err(PluginError::load(
                id.as_str(),
                "plugin failed structural validation",
            ));
        }

        let context = match PluginContext::new(
            id.clone(),
            &self.config.root,
            manifest.configuration.as_ref(),
            self.bus.clone(),
            Arc::clone(&self.tasks),
        ) {
            Ok(context) => context,
            Err(e) => {
                self.sandbox.destroy_context(id.as_str());
                return Err(e);
            },
        };

        let first_load = match self.registry.register_plugin(&manifest, path) {
            Ok(first) => first,
            Err(e) => {
                self.sandbox.destroy_context(id.as_str());
                return Err(e);
            },
        };

        let sandboxed = loaded.sandboxed;
        let managed = Arc::new(ManagedPlugin { loaded, context });
        self.plugins
            .write()
            .await
            .insert(id.to_string(), Arc::clone(&managed));

        if first_load
            && let Err(e) = self.fire_lifecycle(&managed, &LifecycleEvent::Install).await
        {
            warn!(plugin_id = %id, error = %e, "Install hook failed");
        }

        info!(
            plugin_id = %id,
            version = %manifest.metadata.version,
            sandboxed,
            first_load,
            "Plugin loaded"
        );
        self.emit(SwitchyardEvent::PluginLoaded {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: id.to_string(),
            version: manifest.metadata.version.clone(),
            sandboxed,
        });
        Ok(id)
    }

    // -------------------------------------------------------------- lifecycle

    /// Enable a loaded plugin. A no-op if it is already enabled.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lifecycle`] if the plugin is not loaded or its
    /// enable hook fails. The plugin stays disabled in the latter case.
    pub async fn enable_plugin(&self, id: &str) -> PluginResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.enable_locked(id).await
    }

    async fn enable_locked(&self, id: &str) -> PluginResult<()> {
        let managed = self.managed(id).await?;
        if self.enabled.read().await.iter().any(|e| e == id) {
            debug!(plugin_id = id, "Plugin already enabled");
            return Ok(());
        }

        self.fire_lifecycle(&managed, &LifecycleEvent::Enable)
            .await
            .map_err(|e| PluginError::lifecycle(id, format!("enable hook failed: {e}")))?;

        self.enabled.write().await.push(id.to_owned());
        self.persist_enabled(id, true);

        info!(plugin_id = id, "Plugin enabled");
        self.emit(SwitchyardEvent::PluginEnabled {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: id.to_owned(),
        });
        Ok(())
    }

    /// Disable an enabled plugin. A no-op if it is already disabled.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lifecycle`] if the plugin is not loaded or its
    /// disable hook fails. The plugin stays enabled in the latter case.
    pub async fn disable_plugin(&self, id: &str) -> PluginResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.disable_locked(id).await
    }

    async fn disable_locked(&self, id: &str) -> PluginResult<()> {
        let managed = self.managed(id).await?;
        if !self.enabled.read().await.iter().any(|e| e == id) {
            debug!(plugin_id = id, "Plugin already disabled");
            return Ok(());
        }

        self.fire_lifecycle(&managed, &LifecycleEvent::Disable)
            .await
            .map_err(|e| PluginError::lifecycle(id, format!("disable hook failed: {e}")))?;

        self.enabled.write().await.retain(|e| e != id);
        self.persist_enabled(id, false);

        info!(plugin_id = id, "Plugin disabled");
        self.emit(SwitchyardEvent::PluginDisabled {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: id.to_owned(),
        });
        Ok(())
    }

    fn persist_enabled(&self, id: &str, enabled: bool) {
        if let Err(e) = self.registry.set_plugin_enabled(id, enabled) {
            warn!(plugin_id = id, enabled, error = %e, "Failed to persist enabled state");
        }
    }

    /// Uninstall a loaded plugin.
    ///
    /// Disables it first if needed, fires the uninstall hook, drops the
    /// plugin and its context, and removes its directory and registry entry.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lifecycle`] if the plugin is not loaded or the
    /// implicit disable fails.
    pub async fn uninstall_plugin(&self, id: &str) -> PluginResult<()> {
        let _guard = self.lifecycle.lock().await;
        let managed = self.managed(id).await?;

        self.disable_locked(id).await?;

        if let Err(e) = self
            .fire_lifecycle(&managed, &LifecycleEvent::Uninstall)
            .await
        {
            warn!(plugin_id = id, error = %e, "Uninstall hook failed");
        }

        self.plugins.write().await.remove(id);
        drop(managed);
        self.sandbox.destroy_context(id);

        if let Err(e) = self.registry.remove_plugin(id) {
            warn!(plugin_id = id, error = %e, "Failed to remove plugin from registry");
        }

        info!(plugin_id = id, "Plugin uninstalled");
        self.emit(SwitchyardEvent::PluginUninstalled {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: id.to_owned(),
        });
        Ok(())
    }

    /// Record a new version for a loaded plugin.
    ///
    /// The plugin is disabled around the update hook and re-enabled if it
    /// was enabled before. Only metadata changes; code is not reloaded.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ValidationFailed`] for a malformed version, or
    /// [`PluginError::Lifecycle`] if the plugin is not loaded or cannot be
    /// disabled or re-enabled.
    pub async fn update_plugin(&self, id: &str, version: &str) -> PluginResult<()> {
        let _guard = self.lifecycle.lock().await;
        let managed = self.managed(id).await?;

        if let Err(e) = semver::Version::parse(version) {
            return Err(PluginError::ValidationFailed {
                plugin: id.to_owned(),
                errors: vec![format!("invalid version '{version}': {e}")],
                warnings: Vec::new(),
            });
        }

        let was_enabled = self.enabled.read().await.iter().any(|e| e == id);
        if was_enabled {
            self.disable_locked(id).await?;
        }

        let from = managed.loaded.metadata.version.clone();
        let event = LifecycleEvent::Update {
            from: from.clone(),
            to: version.to_owned(),
        };
        if let Err(e) = self.fire_lifecycle(&managed, &event).await {
            warn!(plugin_id = id, error = %e, "Update hook failed");
        }

        let mut loaded = managed.loaded.clone();
        loaded.metadata.version = version.to_owned();
        loaded.manifest.metadata.version = version.to_owned();
        let updated = Arc::new(ManagedPlugin {
            loaded,
            context: managed.context.clone(),
        });
        drop(managed);
        self.plugins.write().await.insert(id.to_owned(), updated);

        let registry_update = PluginRegistryUpdate {
            version: Some(version.to_owned()),
            ..PluginRegistryUpdate::default()
        };
        if let Err(e) = self.registry.update_plugin(id, registry_update) {
            warn!(plugin_id = id, error = %e, "Failed to record plugin update");
        }

        if was_enabled {
            self.enable_locked(id).await?;
        }

        info!(plugin_id = id, from = %from, to = version, "Plugin updated");
        self.emit(SwitchyardEvent::PluginUpdated {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: id.to_owned(),
            from_version: from,
            to_version: version.to_owned(),
        });
        Ok(())
    }

    /// Disable hooks and drop every plugin without touching the registry.
    ///
    /// Enabled flags stay persisted, so the next batch load restores them.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let enabled: Vec<String> = std::mem::take(&mut *self.enabled.write().await);
        for id in &enabled {
            let Ok(managed) = self.managed(id).await else {
                continue;
            };
            if let Err(e) = self.fire_lifecycle(&managed, &LifecycleEvent::Disable).await {
                warn!(plugin_id = %id, error = %e, "Disable hook failed during shutdown");
            }
        }

        let plugins: Vec<String> = self.plugins.write().await.drain().map(|(id, _)| id).collect();
        for id in &plugins {
            self.sandbox.destroy_context(id);
        }
        info!(count = plugins.len(), "Plugin manager shut down");
    }

    async fn fire_lifecycle(
        &self,
        managed: &ManagedPlugin,
        event: &LifecycleEvent,
    ) -> PluginResult<()> {
        let hook = event.hook();
        if !managed.loaded.hooks.has_lifecycle(hook) {
            return Ok(());
        }
        debug!(plugin_id = %managed.loaded.id, hook = hook.export_name(), "Firing lifecycle hook");

        bounded(
            self.config.hook_timeout,
            managed.loaded.plugin.on_lifecycle(event, &managed.context),
        )
        .await
        .map_err(|message| PluginError::HookFailed {
            plugin_id: managed.loaded.id.to_string(),
            hook: hook.export_name().to_owned(),
            message,
        })
    }

    // ---------------------------------------------------------------- dispatch

    /// Call `hook` on every enabled plugin that implements it.
    ///
    /// Plugins are called one at a time in enable order. Failures are logged
    /// and returned as outcomes; they never stop the remaining plugins.
    pub async fn call_hook(&self, hook: TaskHook, args: &[Value]) -> Vec<HookOutcome> {
        let targets = self.hook_targets(hook).await;
        let mut outcomes = Vec::with_capacity(targets.len());
        for managed in targets {
            let result = self.run_task_hook(&managed, hook, args).await;
            outcomes.push(HookOutcome {
                plugin_id: managed.loaded.id.clone(),
                result,
            });
        }
        outcomes
    }

    /// Thread `value` through every enabled plugin implementing `hook`.
    ///
    /// Each plugin receives the current value; a non-null return replaces
    /// it. Failing plugins are logged and skipped.
    pub async fn pipe_hook(&self, hook: TaskHook, value: Value) -> Value {
        let mut current = value;
        for managed in self.hook_targets(hook).await {
            let args = [current.clone()];
            if let Ok(next) = self.run_task_hook(&managed, hook, &args).await
                && !next.is_null()
            {
                current = next;
            }
        }
        current
    }

    /// Enabled plugins implementing `hook`, in enable order. Taken under a
    /// brief read lock so no lock is held while plugin code runs.
    async fn hook_targets(&self, hook: TaskHook) -> Vec<Arc<ManagedPlugin>> {
        let enabled = self.enabled.read().await;
        let plugins = self.plugins.read().await;
        enabled
            .iter()
            .filter_map(|id| plugins.get(id))
            .filter(|m| m.loaded.hooks.has_task(hook))
            .cloned()
            .collect()
    }

    async fn run_task_hook(
        &self,
        managed: &ManagedPlugin,
        hook: TaskHook,
        args: &[Value],
    ) -> PluginResult<Value> {
        let plugin_id = &managed.loaded.id;
        let result = bounded(
            self.config.hook_timeout,
            managed.loaded.plugin.on_task(hook, args, &managed.context),
        )
        .await;

        match result {
            Ok(value) => {
                debug!(plugin_id = %plugin_id, hook = hook.export_name(), "Hook completed");
                Ok(value)
            },
            Err(message) => {
                warn!(
                    plugin_id = %plugin_id,
                    hook = hook.export_name(),
                    error = %message,
                    "Hook failed"
                );
                Err(PluginError::HookFailed {
                    plugin_id: plugin_id.to_string(),
                    hook: hook.export_name().to_owned(),
                    message,
                })
            },
        }
    }

    // --------------------------------------------------------------- accessors

    /// A loaded plugin.
    pub async fn get_plugin(&self, id: &str) -> Option<LoadedPlugin> {
        self.plugins.read().await.get(id).map(|m| m.loaded.clone())
    }

    /// The context of a loaded plugin.
    pub async fn plugin_context(&self, id: &str) -> Option<PluginContext> {
        self.plugins.read().await.get(id).map(|m| m.context.clone())
    }

    /// Enabled plugins in enable order.
    pub async fn get_enabled_plugins(&self) -> Vec<LoadedPlugin> {
        let enabled = self.enabled.read().await;
        let plugins = self.plugins.read().await;
        enabled
            .iter()
            .filter_map(|id| plugins.get(id).map(|m| m.loaded.clone()))
            .collect()
    }

    /// Every loaded plugin, sorted by id.
    pub async fn get_all_plugins(&self) -> Vec<LoadedPlugin> {
        let mut all: Vec<LoadedPlugin> = self
            .plugins
            .read()
            .await
            .values()
            .map(|m| m.loaded.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Whether `id` is loaded and enabled.
    pub async fn is_plugin_enabled(&self, id: &str) -> bool {
        self.enabled.read().await.iter().any(|e| e == id)
    }

    /// Whether `id` is loaded.
    pub async fn is_plugin_loaded(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("root", &self.config.root)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

/// Read the manifest in `path` and run every static check on it.
fn read_validated_manifest(path: &Path, policy: &PermissionPolicy) -> PluginResult<PluginManifest> {
    let value = manifest::read_manifest_value(path)?;
    let label = value
        .pointer("/metadata/id")
        .and_then(Value::as_str)
        .map_or_else(|| path.display().to_string(), str::to_owned);

    let mut warnings = validator::validate_manifest_value(&value).into_result(&label)?;
    let manifest: PluginManifest =
        serde_json::from_value(value).map_err(|e| PluginError::ManifestParseError {
            path: manifest::manifest_path(path),
            message: e.to_string(),
        })?;
    warnings.extend(
        validator::check_permission_policy(&manifest.permissions_or_default(), policy)
            .into_result(&label)?,
    );

    for warning in warnings {
        warn!(plugin_id = %label, %warning, "Manifest warning");
    }
    Ok(manifest)
}

/// Await `fut`, bounded by `limit` when set.
async fn bounded<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = PluginResult<T>>,
) -> Result<T, String> {
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => return Err(format!("timed out after {limit:?}")),
        },
        None => fut.await,
    };
    result.map_err(|e| e.to_string())
}
