//! Plugin lifecycle and sandboxing for the Switchyard task router.
//!
//! Third-party plugins hook into task creation and execution. This crate
//! discovers them on disk, validates their manifests, runs them inside an
//! Extism WebAssembly sandbox with a capability allow-list, supervises their
//! lifecycle, and dispatches task hooks across them without letting one
//! failing plugin break the others.
//!
//! - [`validator`]: pure checks over manifests, permissions, schemas, and code
//! - [`Sandbox`]: per-plugin execution contexts with quotas and gated modules
//! - [`PluginLoader`]: turns a plugin directory into a [`LoadedPlugin`]
//! - [`PluginRegistry`]: the durable `registry.json` catalogue
//! - [`PluginManager`]: the lifecycle state machine and hook dispatcher
//!
//! # Layout
//!
//! ```text
//! <root>/registry.json
//! <root>/<id>/plugin.json
//! <root>/<id>/<main>
//! <root>/<id>/config.json
//! <root>/<id>/storage/<key>.json
//! ```
//!
//! # Trust
//!
//! Plugins listed as trusted load natively (`builtin:<name>`) or as WASM
//! with WASI. Everything else is sandboxed: no WASI, only the module groups
//! its manifest permissions unlock, and a wall-clock limit on every call.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod context;
pub mod error;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod plugin;
pub mod plugin_dirs;
pub mod registry;
pub mod sandbox;
pub mod validator;

pub use context::{PluginContext, TaskApi};
pub use error::{PluginError, PluginResult};
pub use loader::{BuiltinFactory, LoadedPlugin, PluginLoader};
pub use manager::{HookOutcome, LoadSummary, PluginManager, PluginManagerConfig};
pub use manifest::{PluginManifest, PluginMetadata, PluginPermissions, load_manifest};
pub use plugin::{HookTable, LifecycleEvent, LifecycleHook, Plugin, PluginId, TaskHook};
pub use registry::{PluginRegistry, PluginRegistryEntry, PluginRegistryUpdate};
pub use sandbox::{Sandbox, SandboxContext, SandboxInstance, SandboxLimits, SandboxOptions};
pub use validator::{ValidationReport, validate_manifest, validate_plugin_code};
