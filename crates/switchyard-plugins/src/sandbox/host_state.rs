//! Shared state for sandbox host functions.

use std::sync::{Arc, Mutex, Weak};

use extism::UserData;
use tokio::runtime::Handle;

use super::SandboxContext;
use crate::context::PluginContext;

/// State behind `UserData<HostState>` for one instance.
pub(crate) struct HostState {
    /// The sandbox context the instance runs in.
    pub(crate) context: Arc<SandboxContext>,
    /// Storage, config, and events. Attached once the manager has built
    /// the plugin's context.
    pub(crate) plugin_ctx: Option<PluginContext>,
    /// The instance itself, for timer callbacks.
    pub(crate) instance: Option<Weak<Mutex<extism::Plugin>>>,
    /// Runtime for bridging async operations in sync host functions.
    pub(crate) runtime_handle: Option<Handle>,
}

impl HostState {
    pub(crate) fn new(context: Arc<SandboxContext>) -> Self {
        Self {
            context,
            plugin_ctx: None,
            instance: None,
            runtime_handle: Handle::try_current().ok(),
        }
    }
}

/// Mutate the state behind `user_data`.
pub(crate) fn update(
    user_data: &UserData<HostState>,
    f: impl FnOnce(&mut HostState),
) -> Result<(), String> {
    let shared = user_data.get().map_err(|e| e.to_string())?;
    let mut state = shared
        .lock()
        .map_err(|e| format!("host state lock poisoned: {e}"))?;
    f(&mut state);
    Ok(())
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("plugin_id", &self.context.plugin_id())
            .field("has_plugin_ctx", &self.plugin_ctx.is_some())
            .field("has_instance", &self.instance.is_some())
            .finish_non_exhaustive()
    }
}
