//! Turning a plugin directory into a runnable plugin.
//!
//! [`PluginLoader::load`] is the trusted path: `builtin:<name>` entries
//! resolve to native plugins registered on the loader, and `.wasm` entries
//! are instantiated with WASI and every module group. [`PluginLoader::load_in_sandbox`]
//! is the default for everything else: no WASI, the manifest's permissions,
//! a code scan, and a short instantiation timeout.
//!
//! Either way the manifest is authoritative: whatever metadata a plugin's
//! constructor declares is recorded but never used for identity.

mod entry;
mod wasm_plugin;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

pub use entry::{
    EntryStyle, ExportKind, ModuleExports, describe_imports, detect_style, inspect_module,
};
pub use wasm_plugin::WasmPlugin;

use crate::error::{PluginError, PluginResult};
use crate::manifest::{PluginCapabilities, PluginManifest, PluginMetadata};
use crate::plugin::{HookTable, Plugin, PluginId};
use crate::sandbox::{Sandbox, SandboxInstance, SandboxOptions};
use crate::validator;

/// Creates a native plugin instance.
pub type BuiltinFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// A plugin ready to be registered with the manager.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    /// Identity, from the manifest.
    pub id: PluginId,
    /// Metadata, from the manifest.
    pub metadata: PluginMetadata,
    /// Capabilities, from the manifest.
    pub capabilities: PluginCapabilities,
    /// The full manifest.
    pub manifest: PluginManifest,
    /// Plugin directory.
    pub path: PathBuf,
    /// Whether the plugin runs inside the sandbox.
    pub sandboxed: bool,
    /// Implemented hooks.
    pub hooks: HookTable,
    /// Exports named like hooks that are not functions.
    pub uncallable_hooks: Vec<String>,
    /// Metadata the plugin declared about itself, if any.
    pub declared: Option<PluginMetadata>,
    /// The runnable instance.
    pub plugin: Arc<dyn Plugin>,
}

/// Loads plugins from their directories.
pub struct PluginLoader {
    sandbox: Arc<Sandbox>,
    builtins: HashMap<String, BuiltinFactory>,
}

impl PluginLoader {
    /// Create a loader that instantiates WASM through `sandbox`.
    #[must_use]
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            sandbox,
            builtins: HashMap::new(),
        }
    }

    /// Register a native plugin reachable as `builtin:<name>`.
    pub fn register_builtin(&mut self, name: impl Into<String>, factory: BuiltinFactory) {
        self.builtins.insert(name.into(), factory);
    }

    /// Whether `builtin:<name>` resolves.
    #[must_use]
    pub fn has_builtin(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    /// The sandbox used for WASM entries.
    #[must_use]
    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Load a trusted plugin.
    ///
    /// `options` supplies quotas and environment for WASM entries; WASI and
    /// every module group are always granted.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::LoadFailed`] if the entry cannot be read,
    /// classified, or instantiated, or names an unknown builtin.
    pub async fn load(
        &self,
        dir: &Path,
        manifest: &PluginManifest,
        options: SandboxOptions,
    ) -> PluginResult<LoadedPlugin> {
        let id = PluginId::new(&manifest.metadata.id)?;

        if let Some(name) = manifest.builtin_name() {
            let factory = self.builtins.get(name).ok_or_else(|| {
                PluginError::load(id.as_str(), format!("no builtin plugin named '{name}'"))
            })?;
            let plugin = factory();
            info!(plugin_id = %id, builtin = name, "Loaded builtin plugin");
            return Ok(assemble(
                id,
                dir,
                manifest,
                false,
                plugin.hooks(),
                Vec::new(),
                plugin.declared_metadata(),
                plugin,
            ));
        }

        let options = SandboxOptions {
            permissions: manifest.permissions_or_default(),
            wasi: true,
            trusted: true,
            root: Some(dir.to_path_buf()),
            ..options
        };
        self.load_wasm(id, dir, manifest, &options, false).await
    }

    /// Load an untrusted plugin inside the sandbox.
    ///
    /// `options` supplies quotas and environment; permissions always come
    /// from the manifest, and WASI is never linked.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::LoadFailed`] for builtin entries and load
    /// failures, or [`PluginError::ValidationFailed`] if the code scan
    /// finds a disallowed import.
    pub async fn load_in_sandbox(
        &self,
        dir: &Path,
        manifest: &PluginManifest,
        options: SandboxOptions,
    ) -> PluginResult<LoadedPlugin> {
        let id = PluginId::new(&manifest.metadata.id)?;
        if manifest.builtin_name().is_some() {
            return Err(PluginError::load(
                id.as_str(),
                "builtin entry points only load on the trusted path",
            ));
        }

        let options = SandboxOptions {
            permissions: manifest.permissions_or_default(),
            wasi: false,
            trusted: false,
            root: Some(dir.to_path_buf()),
            ..options
        };
        self.load_wasm(id, dir, manifest, &options, true).await
    }

    async fn load_wasm(
        &self,
        id: PluginId,
        dir: &Path,
        manifest: &PluginManifest,
        options: &SandboxOptions,
        sandboxed: bool,
    ) -> PluginResult<LoadedPlugin> {
        let entry_path = dir.join(&manifest.main);
        let bytes = tokio::fs::read(&entry_path).await.map_err(|e| {
            PluginError::load(
                id.as_str(),
                format!("failed to read {}: {e}", entry_path.display()),
            )
        })?;

        detect_style(&entry_path, &bytes).map_err(|e| PluginError::load(id.as_str(), e))?;
        let exports = inspect_module(&bytes).map_err(|e| PluginError::load(id.as_str(), e))?;

        if sandboxed {
            let listing = describe_imports(&bytes).map_err(|e| PluginError::load(id.as_str(), e))?;
            let warnings = validator::validate_plugin_code(&listing).into_result(id.as_str())?;
            for warning in warnings {
                warn!(plugin_id = %id, %warning, "Plugin code warning");
            }
        }

        self.sandbox.create_context(id.as_str(), options);
        let (instance, declared) = self
            .instantiate(&id, bytes, manifest, exports.constructor(), options)
            .await
            .inspect_err(|_| {
                self.sandbox.destroy_context(id.as_str());
            })?;
        if let Some(declared) = &declared
            && declared != &manifest.metadata
        {
            debug!(
                plugin_id = %id,
                declared_id = %declared.id,
                "Plugin-declared metadata differs from manifest; manifest wins"
            );
        }

        let hooks = HookTable::from_exports(exports.functions.iter().map(String::as_str));
        let uncallable = exports.uncallable_hooks().map(str::to_owned).collect();
        let plugin: Arc<dyn Plugin> =
            Arc::new(WasmPlugin::new(instance, hooks.clone(), declared.clone()));

        info!(plugin_id = %id, sandboxed, path = %dir.display(), "Loaded WASM plugin");
        Ok(assemble(
            id, dir, manifest, sandboxed, hooks, uncallable, declared, plugin,
        ))
    }

    /// Instantiate `bytes` in the existing context and run the constructor,
    /// if any.
    async fn instantiate(
        &self,
        id: &PluginId,
        bytes: Vec<u8>,
        manifest: &PluginManifest,
        constructor: Option<&str>,
        options: &SandboxOptions,
    ) -> PluginResult<(SandboxInstance, Option<PluginMetadata>)> {
        let instance = self
            .sandbox
            .execute(id.as_str(), bytes, options)
            .await
            .map_err(|e| PluginError::load(id.as_str(), e))?;

        let Some(constructor) = constructor else {
            return Ok((instance, None));
        };
        let input = serde_json::to_vec(manifest)?;
        let output = instance
            .call(constructor, input)
            .await
            .map_err(|e| PluginError::load(id.as_str(), e))?;
        Ok((instance, declared_metadata(&output)))
    }

    /// Structural check of a loaded plugin.
    ///
    /// Required metadata must be non-empty and every export named like a
    /// hook must be callable.
    #[must_use]
    pub fn validate_plugin(plugin: &LoadedPlugin) -> bool {
        let meta = &plugin.metadata;
        let missing: Vec<&str> = [
            ("id", &meta.id),
            ("name", &meta.name),
            ("version", &meta.version),
            ("author", &meta.author),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect();

        if !missing.is_empty() {
            warn!(plugin_id = %plugin.id, ?missing, "Loaded plugin is missing metadata");
            return false;
        }
        if !plugin.uncallable_hooks.is_empty() {
            warn!(
                plugin_id = %plugin.id,
                hooks = ?plugin.uncallable_hooks,
                "Loaded plugin exports hooks that are not functions"
            );
            return false;
        }
        true
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut builtins: Vec<&String> = self.builtins.keys().collect();
        builtins.sort();
        f.debug_struct("PluginLoader")
            .field("builtins", &builtins)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
fn assemble(
    id: PluginId,
    dir: &Path,
    manifest: &PluginManifest,
    sandboxed: bool,
    hooks: HookTable,
    uncallable_hooks: Vec<String>,
    declared: Option<PluginMetadata>,
    plugin: Arc<dyn Plugin>,
) -> LoadedPlugin {
    LoadedPlugin {
        id,
        metadata: manifest.metadata.clone(),
        capabilities: manifest.capabilities.clone(),
        manifest: manifest.clone(),
        path: dir.to_path_buf(),
        sandboxed,
        hooks,
        uncallable_hooks,
        declared,
        plugin,
    }
}

/// Constructor output: either `{"metadata": {...}}` or the metadata object
/// itself. Anything else declares nothing.
fn declared_metadata(output: &[u8]) -> Option<PluginMetadata> {
    let value: serde_json::Value = serde_json::from_slice(output).ok()?;
    let metadata = value.get("metadata").cloned().unwrap_or(value);
    if !metadata.is_object() {
        return None;
    }
    serde_json::from_value(metadata).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{LifecycleHook, TaskHook};
    use crate::sandbox::{SandboxLimits, fixtures};
    use serde_json::json;

    fn manifest(id: &str, main: &str) -> PluginManifest {
        serde_json::from_value(json!({
            "metadata": { "id": id, "name": "Demo", "version": "1.0.0", "author": "Tests" },
            "capabilities": {},
            "main": main
        }))
        .unwrap()
    }

    fn loader() -> PluginLoader {
        PluginLoader::new(Arc::new(Sandbox::new(SandboxLimits::default())))
    }

    struct Native;

    #[async_trait::async_trait]
    impl Plugin for Native {
        fn hooks(&self) -> HookTable {
            HookTable::new().with_lifecycle(LifecycleHook::Install)
        }

        fn declared_metadata(&self) -> Option<PluginMetadata> {
            Some(PluginMetadata {
                id: "something-else".into(),
                ..PluginMetadata::default()
            })
        }
    }

    #[tokio::test]
    async fn test_builtin_overwritten_by_manifest() {
        let mut loader = loader();
        loader.register_builtin("native", Arc::new(|| Arc::new(Native) as Arc<dyn Plugin>));
        let tmp = tempfile::tempdir().unwrap();

        let loaded = loader
            .load(
                tmp.path(),
                &manifest("native-demo", "builtin:native"),
                SandboxOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(loaded.id.as_str(), "native-demo");
        assert_eq!(loaded.metadata.id, "native-demo");
        assert_eq!(loaded.declared.unwrap().id, "something-else");
        assert!(!loaded.sandboxed);
        assert!(loaded.hooks.has_lifecycle(LifecycleHook::Install));
    }

    #[tokio::test]
    async fn test_unknown_builtin_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = loader()
            .load(
                tmp.path(),
                &manifest("demo", "builtin:missing"),
                SandboxOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { .. }));
    }

    #[tokio::test]
    async fn test_builtin_refused_in_sandbox() {
        let mut loader = loader();
        loader.register_builtin("native", Arc::new(|| Arc::new(Native) as Arc<dyn Plugin>));
        let tmp = tempfile::tempdir().unwrap();
        let err = loader
            .load_in_sandbox(
                tmp.path(),
                &manifest("demo", "builtin:native"),
                SandboxOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_entry_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = loader()
            .load_in_sandbox(
                tmp.path(),
                &manifest("demo", "plugin.wasm"),
                SandboxOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sandboxed_wasm_discovers_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("plugin.wasm"), fixtures::hooks_module()).unwrap();
        let loader = loader();

        let loaded = loader
            .load_in_sandbox(
                tmp.path(),
                &manifest("demo", "plugin.wasm"),
                SandboxOptions::default(),
            )
            .await
            .unwrap();
        assert!(loaded.sandboxed);
        assert!(loaded.hooks.has_lifecycle(LifecycleHook::Enable));
        assert!(loaded.hooks.has_task(TaskHook::BeforeTaskCreate));
        assert!(!loaded.hooks.has_lifecycle(LifecycleHook::Install));
        assert!(loaded.declared.is_none());
        assert!(PluginLoader::validate_plugin(&loaded));

        let context = loader.sandbox().context("demo").unwrap();
        assert!(!context.wasi());
        assert!(!context.is_trusted());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_constructor_is_invoked() {
        let tmp = tempfile::tempdir().unwrap();
        let bytes = fixtures::module(
            &[
                ("default", fixtures::return_zero()),
                ("on_install", fixtures::return_zero()),
            ],
            None,
        );
        std::fs::write(tmp.path().join("plugin.wasm"), bytes).unwrap();

        let loaded = loader()
            .load(
                tmp.path(),
                &manifest("demo", "plugin.wasm"),
                SandboxOptions::default(),
            )
            .await
            .unwrap();
        assert!(!loaded.sandboxed);
        assert!(loaded.hooks.has_lifecycle(LifecycleHook::Install));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_constructor_fails_load() {
        let tmp = tempfile::tempdir().unwrap();
        let bytes = fixtures::module(&[("plugin", fixtures::return_one())], None);
        std::fs::write(tmp.path().join("plugin.wasm"), bytes).unwrap();

        let loader = loader();
        let err = loader
            .load_in_sandbox(
                tmp.path(),
                &manifest("demo", "plugin.wasm"),
                SandboxOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { .. }));
        assert!(loader.sandbox().context("demo").is_none());
        assert_eq!(loader.sandbox().context_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_instantiation_releases_context() {
        let tmp = tempfile::tempdir().unwrap();
        let bytes = fixtures::guest_module(&[(
            "plugin",
            fixtures::body([
                fixtures::string("tick"),
                vec![
                    wasm_encoder::Instruction::I64Const(60_000),
                    fixtures::HostImport::SetInterval.call(),
                    wasm_encoder::Instruction::Drop,
                ],
                fixtures::return_one(),
            ]),
        )]);
        std::fs::write(tmp.path().join("plugin.wasm"), bytes).unwrap();

        let loader = loader();
        let err = loader
            .load_in_sandbox(
                tmp.path(),
                &manifest("ticker", "plugin.wasm"),
                SandboxOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { .. }));
        assert!(loader.sandbox().context("ticker").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trusted_wasm_keeps_supplied_env() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("plugin.wasm"), fixtures::hooks_module()).unwrap();
        let mut options = SandboxOptions::default();
        options.env.insert("ANY_NAME".into(), "value".into());

        let loader = loader();
        let loaded = loader
            .load(tmp.path(), &manifest("demo", "plugin.wasm"), options)
            .await
            .unwrap();
        assert!(!loaded.sandboxed);
        let context = loader.sandbox().context("demo").unwrap();
        assert!(context.wasi());
        assert!(context.is_trusted());
        assert_eq!(context.env_var("ANY_NAME").unwrap().as_deref(), Some("value"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_uncallable_hook_fails_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let bytes = fixtures::module(&[("on_enable", fixtures::return_zero())], Some("on_install"));
        std::fs::write(tmp.path().join("plugin.wasm"), bytes).unwrap();

        let loaded = loader()
            .load_in_sandbox(
                tmp.path(),
                &manifest("demo", "plugin.wasm"),
                SandboxOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(loaded.uncallable_hooks, vec!["on_install"]);
        assert!(!PluginLoader::validate_plugin(&loaded));
    }

    #[test]
    fn test_declared_metadata_shapes() {
        let nested = br#"{"metadata":{"id":"x","name":"X","version":"1.0.0","author":"a"}}"#;
        assert_eq!(declared_metadata(nested).unwrap().id, "x");
        let flat = br#"{"id":"y","name":"Y","version":"1.0.0","author":"a"}"#;
        assert_eq!(declared_metadata(flat).unwrap().id, "y");
        assert!(declared_metadata(b"").is_none());
        assert!(declared_metadata(b"42").is_none());
    }
}
