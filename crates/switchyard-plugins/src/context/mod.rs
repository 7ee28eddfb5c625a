//! Per-plugin execution context.
//!
//! A [`PluginContext`] bundles the handles a plugin gets from the host:
//! a prefixed logger, file-backed storage and configuration, and the host
//! API. Contexts are created by the manager after a successful load and
//! dropped on uninstall.

mod api;
mod config;
mod logger;
mod storage;

use std::path::Path;
use std::sync::Arc;

use switchyard_events::EventBus;

pub use api::{PluginApi, PluginEvents, PluginUi, TaskApi, UnavailableTaskApi};
pub use config::PluginConfig;
pub use logger::PluginLogger;
pub use storage::PluginStorage;

use crate::error::PluginResult;
use crate::manifest::PluginConfigurationSchema;
use crate::plugin::PluginId;

/// Handles given to one plugin.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Owning plugin.
    pub plugin_id: PluginId,
    /// Id-prefixed logger.
    pub logger: PluginLogger,
    /// Key/value storage under `<root>/<id>/storage`.
    pub storage: PluginStorage,
    /// Configuration at `<root>/<id>/config.json`.
    pub config: PluginConfig,
    /// Host API.
    pub api: PluginApi,
}

impl PluginContext {
    /// Build the context for `plugin_id` under the plugins `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing `config.json` cannot be read.
    pub fn new(
        plugin_id: PluginId,
        root: &Path,
        schema: Option<&PluginConfigurationSchema>,
        bus: EventBus,
        tasks: Arc<dyn TaskApi>,
    ) -> PluginResult<Self> {
        let config = PluginConfig::open(root, plugin_id.as_str(), schema)?;
        Ok(Self {
            logger: PluginLogger::new(plugin_id.as_str()),
            storage: PluginStorage::new(root, plugin_id.as_str()),
            api: PluginApi::new(&plugin_id, bus, tasks),
            config,
            plugin_id,
        })
    }

    /// A context with no schema, a private bus, and no task API.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing `config.json` cannot be read.
    pub fn for_testing(plugin_id: PluginId, root: &Path) -> PluginResult<Self> {
        Self::new(
            plugin_id,
            root,
            None,
            EventBus::new(),
            Arc::new(UnavailableTaskApi),
        )
    }
}
