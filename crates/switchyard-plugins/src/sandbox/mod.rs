//! Capability-restricted execution of plugin code.
//!
//! Every plugin id owns at most one [`SandboxContext`]: its module
//! allow-list, timers, environment, and quotas. [`Sandbox::execute`]
//! instantiates a WebAssembly module through Extism against that context.
//!
//! ```text
//! ┌──────────────┐     ┌─────────────────┐     ┌──────────────┐
//! │ Sandbox      │────▶│ SandboxInstance │────▶│ WASM guest   │
//! │ (contexts)   │     │ Arc<Mutex<..>>  │     │ hook exports │
//! └──────────────┘     └─────────────────┘     └──────────────┘
//!                              │
//!                              ▼
//!                      ┌──────────────────┐
//!                      │ sy_* host fns    │
//!                      │ UserData<State>  │
//!                      └──────────────────┘
//! ```
//!
//! Instantiation and calls run on the blocking pool under a wall-clock
//! timeout. Extism's own timeout stops the guest; a call the host gave up
//! on is abandoned.

mod host_functions;
mod host_state;
pub mod modules;
pub mod timers;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use extism::{Manifest, PluginBuilder, UserData, Wasm};
use switchyard_config::SandboxSection;
use tracing::{debug, info, warn};

pub use modules::{GATED_MODULES, HostModule, ModuleGroup, ModuleLoader, SAFE_MODULES};
pub use timers::{TimerCallback, TimerLimits, TimerRegistry};

use crate::context::{PluginContext, PluginLogger};
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginPermissions;
use host_state::HostState;

/// WASM pages per MiB.
const PAGES_PER_MB: u64 = 16;

/// Sandbox-wide quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Default wall-clock limit per call.
    pub timeout: Duration,
    /// Upper bound for instantiation.
    pub load_timeout: Duration,
    /// Default linear memory cap, in MiB.
    pub memory_limit_mb: u64,
    /// Timer quotas.
    pub timers: TimerLimits,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from_section(&SandboxSection::default())
    }
}

impl SandboxLimits {
    /// Limits from the `[sandbox]` configuration section.
    #[must_use]
    pub fn from_section(section: &SandboxSection) -> Self {
        Self {
            timeout: Duration::from_millis(section.timeout_ms),
            load_timeout: Duration::from_millis(section.load_timeout_ms),
            memory_limit_mb: section.memory_limit_mb,
            timers: TimerLimits {
                max_timers: section.max_timers,
                min_interval: Duration::from_millis(section.min_interval_ms),
                max_interval: Duration::from_millis(section.max_interval_ms),
            },
        }
    }
}

/// Per-context overrides. Unset fields fall back to [`SandboxLimits`].
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Wall-clock limit per call.
    pub timeout: Option<Duration>,
    /// Linear memory cap, in MiB.
    pub memory_limit_mb: Option<u64>,
    /// Narrow the safe module baseline.
    pub allowed_modules: Option<Vec<String>>,
    /// Environment visible to the plugin, filtered by `permissions`.
    pub env: HashMap<String, String>,
    /// Granted permissions.
    pub permissions: PluginPermissions,
    /// Link WASI.
    pub wasi: bool,
    /// Grant every module group and the full environment.
    pub trusted: bool,
    /// Plugin directory.
    pub root: Option<PathBuf>,
}

impl SandboxOptions {
    /// Options for an untrusted plugin with `permissions`.
    #[must_use]
    pub fn with_permissions(permissions: PluginPermissions) -> Self {
        Self {
            permissions,
            ..Self::default()
        }
    }

    /// Set the call timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the memory cap.
    #[must_use]
    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }
}

/// Isolated state for one plugin.
#[derive(Debug)]
pub struct SandboxContext {
    plugin_id: String,
    timeout: Duration,
    memory_limit_mb: u64,
    wasi: bool,
    trusted: bool,
    root: Option<PathBuf>,
    permissions: PluginPermissions,
    env: HashMap<String, String>,
    modules: ModuleLoader,
    timers: TimerRegistry,
    logger: PluginLogger,
    created: Instant,
}

impl SandboxContext {
    fn new(plugin_id: &str, options: &SandboxOptions, limits: &SandboxLimits) -> Self {
        let env = if options.trusted {
            options.env.clone()
        } else {
            let declared = options.permissions.env_vars();
            options
                .env
                .iter()
                .filter(|(name, _)| declared.contains(name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        Self {
            plugin_id: plugin_id.to_owned(),
            timeout: options.timeout.unwrap_or(limits.timeout),
            memory_limit_mb: options.memory_limit_mb.unwrap_or(limits.memory_limit_mb),
            wasi: options.wasi,
            trusted: options.trusted,
            root: options.root.clone(),
            permissions: options.permissions.clone(),
            env,
            modules: ModuleLoader::new(
                plugin_id,
                &options.permissions,
                options.allowed_modules.as_deref(),
                options.trusted,
            ),
            timers: TimerRegistry::new(plugin_id, limits.timers),
            logger: PluginLogger::new(plugin_id),
            created: Instant::now(),
        }
    }

    /// Owning plugin.
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Wall-clock limit per call.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Linear memory cap, in MiB.
    #[must_use]
    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }

    /// Whether WASI is linked.
    #[must_use]
    pub fn wasi(&self) -> bool {
        self.wasi
    }

    /// Whether this context was created for a trusted plugin.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Plugin directory, if known.
    #[must_use]
    pub fn root(&self) -> Option<&PathBuf> {
        self.root.as_ref()
    }

    /// Granted permissions.
    #[must_use]
    pub fn permissions(&self) -> &PluginPermissions {
        &self.permissions
    }

    /// The module loader.
    #[must_use]
    pub fn modules(&self) -> &ModuleLoader {
        &self.modules
    }

    /// Resolve a module through the allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ModuleDenied`] if the module is not allowed.
    pub fn require(&self, name: &str) -> PluginResult<HostModule> {
        self.modules.require(name)
    }

    /// The timer facility.
    #[must_use]
    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// The id-prefixed logger.
    #[must_use]
    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    /// Milliseconds since the context was created.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Read an environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ModuleDenied`] unless the `env` module is
    /// allowed and, for untrusted plugins, `name` was declared.
    pub fn env_var(&self, name: &str) -> PluginResult<Option<String>> {
        self.require("env")?;
        if !self.trusted && !self.permissions.env_vars().iter().any(|v| v == name) {
            return Err(PluginError::ModuleDenied {
                plugin_id: self.plugin_id.clone(),
                module: "env".to_owned(),
                reason: format!("variable '{name}' was not declared"),
            });
        }
        Ok(self.env.get(name).cloned())
    }

    fn release(&self) {
        let cleared = self.timers.clear_all();
        self.modules.clear_cache();
        debug!(plugin_id = %self.plugin_id, timers = cleared, "Released sandbox context");
    }
}

/// Owner of every sandbox context.
#[derive(Debug, Default)]
pub struct Sandbox {
    limits: SandboxLimits,
    contexts: Mutex<HashMap<String, Arc<SandboxContext>>>,
}

impl Sandbox {
    /// Create a sandbox with `limits`.
    #[must_use]
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            limits,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// The sandbox-wide limits.
    #[must_use]
    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    fn contexts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SandboxContext>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the context for `plugin_id`, replacing and releasing any
    /// existing one. Never fails.
    pub fn create_context(&self, plugin_id: &str, options: &SandboxOptions) -> Arc<SandboxContext> {
        let context = Arc::new(SandboxContext::new(plugin_id, options, &self.limits));
        if let Some(previous) = self
            .contexts()
            .insert(plugin_id.to_owned(), Arc::clone(&context))
        {
            previous.release();
        }
        debug!(
            plugin_id,
            timeout = ?context.timeout,
            memory_limit_mb = context.memory_limit_mb,
            trusted = context.trusted,
            "Created sandbox context"
        );
        context
    }

    /// The context for `plugin_id`, if any.
    #[must_use]
    pub fn context(&self, plugin_id: &str) -> Option<Arc<SandboxContext>> {
        self.contexts().get(plugin_id).cloned()
    }

    /// Number of live contexts.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts().len()
    }

    /// Release and drop the context for `plugin_id`. Returns whether one
    /// existed.
    pub fn destroy_context(&self, plugin_id: &str) -> bool {
        let removed = self.contexts().remove(plugin_id);
        match removed {
            Some(context) => {
                context.release();
                info!(plugin_id, "Destroyed sandbox context");
                true
            },
            None => false,
        }
    }

    /// Instantiate `code` for `plugin_id`.
    ///
    /// Creates the context from `options` on first use. Instantiation is
    /// bounded by the smaller of the context timeout and the sandbox load
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SandboxError`] on timeout, compile failure,
    /// trap, or panic.
    pub async fn execute(
        &self,
        plugin_id: &str,
        code: Vec<u8>,
        options: &SandboxOptions,
    ) -> PluginResult<SandboxInstance> {
        let context = match self.context(plugin_id) {
            Some(context) => context,
            None => self.create_context(plugin_id, options),
        };

        let manifest = extism_manifest(code, &context);
        let host = UserData::new(HostState::new(Arc::clone(&context)));
        let wasi = context.wasi;
        let builder_host = host.clone();
        let build = tokio::task::spawn_blocking(move || {
            let builder = PluginBuilder::new(manifest).with_wasi(wasi);
            host_functions::register_host_functions(builder, builder_host).build()
        });

        let limit = context.timeout.min(self.limits.load_timeout);
        let plugin = match tokio::time::timeout(limit, build).await {
            Err(_) => {
                return Err(PluginError::sandbox(
                    plugin_id,
                    format!("instantiation timed out after {}ms", limit.as_millis()),
                ));
            },
            Ok(Err(e)) => {
                return Err(PluginError::sandbox(
                    plugin_id,
                    format!("instantiation panicked: {e}"),
                ));
            },
            Ok(Ok(Err(e))) => {
                return Err(PluginError::sandbox(
                    plugin_id,
                    format!("failed to build module: {e}"),
                ));
            },
            Ok(Ok(Ok(plugin))) => plugin,
        };

        let plugin = Arc::new(Mutex::new(plugin));
        host_state::update(&host, |state| state.instance = Some(Arc::downgrade(&plugin)))
            .map_err(|e| PluginError::sandbox(plugin_id, e))?;

        debug!(plugin_id, "Instantiated sandboxed module");
        Ok(SandboxInstance {
            plugin_id: plugin_id.to_owned(),
            timeout: context.timeout,
            plugin,
            host,
        })
    }
}

fn extism_manifest(code: Vec<u8>, context: &SandboxContext) -> Manifest {
    let pages = context.memory_limit_mb.saturating_mul(PAGES_PER_MB);
    let mut manifest = Manifest::new([Wasm::data(code)])
        .with_timeout(context.timeout)
        .with_memory_max(u32::try_from(pages).unwrap_or(u32::MAX));
    if context.modules.is_allowed("http") {
        for host in context.permissions.hosts() {
            manifest = manifest.with_allowed_host(host.clone());
        }
    }
    manifest
}

/// A live, instantiated module.
///
/// Calls are serialized on the instance mutex.
pub struct SandboxInstance {
    plugin_id: String,
    timeout: Duration,
    plugin: Arc<Mutex<extism::Plugin>>,
    host: UserData<HostState>,
}

impl SandboxInstance {
    /// Owning plugin.
    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Whether the module exports a function named `name`.
    #[must_use]
    pub fn function_exists(&self, name: &str) -> bool {
        self.plugin
            .lock()
            .map(|plugin| plugin.function_exists(name))
            .unwrap_or(false)
    }

    /// Attach the plugin context that storage, config, and event host
    /// functions operate on.
    ///
    /// # Errors
    ///
    /// Returns a sandbox error if the host state is unavailable.
    pub fn set_plugin_context(&self, context: PluginContext) -> PluginResult<()> {
        host_state::update(&self.host, |state| state.plugin_ctx = Some(context))
            .map_err(|e| PluginError::sandbox(&self.plugin_id, e))
    }

    /// Call an export with raw input bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SandboxError`] on timeout, trap, or panic.
    pub async fn call(&self, export: &str, input: Vec<u8>) -> PluginResult<Vec<u8>> {
        let plugin = Arc::clone(&self.plugin);
        let plugin_id = self.plugin_id.clone();
        let name = export.to_owned();
        let task = tokio::task::spawn_blocking(move || {
            let mut plugin = plugin.lock().map_err(|e| {
                PluginError::sandbox(&plugin_id, format!("instance lock poisoned: {e}"))
            })?;
            plugin
                .call::<&[u8], Vec<u8>>(&name, &input)
                .map_err(|e| PluginError::sandbox(&plugin_id, format!("{name} failed: {e}")))
        });

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                warn!(
                    plugin_id = %self.plugin_id,
                    export,
                    timeout = ?self.timeout,
                    "Sandboxed call timed out"
                );
                Err(PluginError::sandbox(
                    &self.plugin_id,
                    format!("{export} timed out after {}ms", self.timeout.as_millis()),
                ))
            },
            Ok(Err(e)) => Err(PluginError::sandbox(
                &self.plugin_id,
                format!("{export} panicked: {e}"),
            )),
            Ok(Ok(result)) => result,
        }
    }
}

impl std::fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("plugin_id", &self.plugin_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod fixtures;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn perms(value: serde_json::Value) -> PluginPermissions {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_create_context_uses_defaults() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let context = sandbox.create_context("demo", &SandboxOptions::default());
        assert_eq!(context.timeout(), Duration::from_secs(30));
        assert_eq!(context.memory_limit_mb(), 64);
        assert!(!context.wasi());
        assert_eq!(sandbox.context_count(), 1);
    }

    #[test]
    fn test_create_context_applies_options() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let options = SandboxOptions::default()
            .timeout(Duration::from_millis(250))
            .memory_limit_mb(8);
        let context = sandbox.create_context("demo", &options);
        assert_eq!(context.timeout(), Duration::from_millis(250));
        assert_eq!(context.memory_limit_mb(), 8);
    }

    #[test]
    fn test_context_require() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let context = sandbox.create_context("demo", &SandboxOptions::default());
        assert!(context.require("path").is_ok());
        assert!(context.require("process").is_err());
        assert!(context.require("../path").is_err());
    }

    #[test]
    fn test_env_filtered_by_declaration() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let mut options = SandboxOptions::with_permissions(perms(json!({
            "system": { "env": ["API_KEY"] }
        })));
        options.env.insert("API_KEY".into(), "secret".into());
        options.env.insert("HOME".into(), "/root".into());
        let context = sandbox.create_context("demo", &options);

        assert_eq!(context.env_var("API_KEY").unwrap().as_deref(), Some("secret"));
        assert!(context.env_var("HOME").is_err());

        let bare = sandbox.create_context("bare", &SandboxOptions::default());
        assert!(bare.env_var("API_KEY").is_err());
    }

    #[test]
    fn test_destroy_context() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        sandbox.create_context("demo", &SandboxOptions::default());
        assert!(sandbox.destroy_context("demo"));
        assert!(!sandbox.destroy_context("demo"));
        assert!(sandbox.context("demo").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreate_releases_previous_timers() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let first = sandbox.create_context("demo", &SandboxOptions::default());
        first
            .timers()
            .set_timeout(Duration::from_secs(5), Arc::new(|| {}))
            .unwrap();
        assert_eq!(first.timers().pending(), 1);

        let second = sandbox.create_context("demo", &SandboxOptions::default());
        assert_eq!(first.timers().pending(), 0);
        assert_eq!(second.timers().pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_rejects_garbage() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let err = sandbox
            .execute("demo", b"not wasm".to_vec(), &SandboxOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::SandboxError { .. }), "{err:?}");
        // The context survives a failed instantiation.
        assert!(sandbox.context("demo").is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_and_call_export() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let instance = sandbox
            .execute("demo", fixtures::hooks_module(), &SandboxOptions::default())
            .await
            .unwrap();
        assert!(instance.function_exists("on_enable"));
        assert!(!instance.function_exists("on_disable"));
        let output = instance.call("on_enable", Vec::new()).await.unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_require_fails_closed() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let instance = sandbox
            .execute(
                "guest",
                fixtures::host_calls_module(),
                &SandboxOptions::default(),
            )
            .await
            .unwrap();

        let output = instance.call("require_path", Vec::new()).await.unwrap();
        let module: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(module, json!({ "name": "path", "group": "safe" }));

        let err = instance
            .call("require_process", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::SandboxError { .. }), "{err:?}");

        // The trap is confined to that call.
        assert!(instance.call("require_path", Vec::new()).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_timer_cap_fails_only_that_call() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let instance = sandbox
            .execute(
                "guest",
                fixtures::host_calls_module(),
                &SandboxOptions::default(),
            )
            .await
            .unwrap();
        let context = sandbox.context("guest").unwrap();
        let cap = context.timers().limits().max_timers;

        for _ in 0..cap {
            instance.call("schedule", Vec::new()).await.unwrap();
        }
        assert_eq!(context.timers().pending(), cap);

        let err = instance.call("schedule", Vec::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::SandboxError { .. }), "{err:?}");
        assert_eq!(context.timers().pending(), cap);
        assert!(instance.call("tick", Vec::new()).await.is_ok());

        assert!(sandbox.destroy_context("guest"));
        assert_eq!(context.timers().pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runaway_call_times_out() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let options = SandboxOptions::default().timeout(Duration::from_millis(200));
        let instance = sandbox
            .execute("spin", fixtures::spin_module(), &options)
            .await
            .unwrap();
        let err = instance.call("handle_task", Vec::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::SandboxError { .. }), "{err:?}");
    }
}
