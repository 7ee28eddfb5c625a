//! Plugin trait, identifiers, and the typed hook set.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::context::PluginContext;
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginMetadata;

/// Unique, stable, human-readable plugin identifier.
///
/// Plugin IDs are non-empty strings of lowercase ASCII letters, digits and
/// hyphens, like `"word-count"` or `"2fa-guard"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PluginId(String);

/// Deserialize with validation so crafted registry files cannot smuggle a
/// path-like id.
impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginId {
    /// Create a new `PluginId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty or contains invalid characters.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        if !Self::is_valid_id(&id) {
            return Err(PluginError::InvalidId(format!(
                "plugin id must match ^[a-z0-9-]+$, got: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    /// Create a `PluginId` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a string is a valid plugin ID without constructing one.
    #[must_use]
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle hooks, fired by the manager on state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleHook {
    /// First-ever load of this id.
    Install,
    /// Plugin enabled.
    Enable,
    /// Plugin disabled.
    Disable,
    /// Plugin being uninstalled.
    Uninstall,
    /// Plugin version changed.
    Update,
}

impl LifecycleHook {
    /// Every lifecycle hook.
    pub const ALL: [Self; 5] = [
        Self::Install,
        Self::Enable,
        Self::Disable,
        Self::Uninstall,
        Self::Update,
    ];

    /// Export name a WASM plugin uses for this hook.
    #[must_use]
    pub fn export_name(self) -> &'static str {
        match self {
            Self::Install => "on_install",
            Self::Enable => "on_enable",
            Self::Disable => "on_disable",
            Self::Uninstall => "on_uninstall",
            Self::Update => "on_update",
        }
    }

    /// Look up a hook by export name.
    #[must_use]
    pub fn from_export_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.export_name() == name)
    }
}

impl fmt::Display for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_name())
    }
}

/// A lifecycle transition delivered to a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// First-ever load.
    Install,
    /// Enabled.
    Enable,
    /// Disabled.
    Disable,
    /// Uninstalling.
    Uninstall,
    /// Version changed from `from` to `to`.
    Update {
        /// Previous version.
        from: String,
        /// New version.
        to: String,
    },
}

impl LifecycleEvent {
    /// The hook this event fires.
    #[must_use]
    pub fn hook(&self) -> LifecycleHook {
        match self {
            Self::Install => LifecycleHook::Install,
            Self::Enable => LifecycleHook::Enable,
            Self::Disable => LifecycleHook::Disable,
            Self::Uninstall => LifecycleHook::Uninstall,
            Self::Update { .. } => LifecycleHook::Update,
        }
    }

    /// JSON payload handed to WASM plugins.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::Update { from, to } => json!({ "hook": self.hook(), "from": from, "to": to }),
            _ => json!({ "hook": self.hook() }),
        }
    }
}

/// Task hooks, fired by the host around task creation and execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskHook {
    /// Before a task is created. Plugins may rewrite the task.
    BeforeTaskCreate,
    /// After a task is created.
    AfterTaskCreate,
    /// Before a task is dispatched to an adapter.
    BeforeTaskExecute,
    /// After an adapter returns.
    AfterTaskExecute,
    /// Before a result is persisted.
    BeforeResultSave,
    /// After a result is persisted.
    AfterResultSave,
    /// Offer to handle a task of a custom type.
    HandleTask,
}

impl TaskHook {
    /// Every task hook.
    pub const ALL: [Self; 7] = [
        Self::BeforeTaskCreate,
        Self::AfterTaskCreate,
        Self::BeforeTaskExecute,
        Self::AfterTaskExecute,
        Self::BeforeResultSave,
        Self::AfterResultSave,
        Self::HandleTask,
    ];

    /// Export name a WASM plugin uses for this hook.
    #[must_use]
    pub fn export_name(self) -> &'static str {
        match self {
            Self::BeforeTaskCreate => "before_task_create",
            Self::AfterTaskCreate => "after_task_create",
            Self::BeforeTaskExecute => "before_task_execute",
            Self::AfterTaskExecute => "after_task_execute",
            Self::BeforeResultSave => "before_result_save",
            Self::AfterResultSave => "after_result_save",
            Self::HandleTask => "handle_task",
        }
    }

    /// Look up a hook by export name.
    #[must_use]
    pub fn from_export_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.export_name() == name)
    }
}

impl fmt::Display for TaskHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_name())
    }
}

/// Which hooks a plugin implements.
///
/// The manager dispatches only through this table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookTable {
    lifecycle: BTreeSet<LifecycleHook>,
    task: BTreeSet<TaskHook>,
}

impl HookTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a lifecycle hook.
    #[must_use]
    pub fn with_lifecycle(mut self, hook: LifecycleHook) -> Self {
        self.lifecycle.insert(hook);
        self
    }

    /// Add a task hook.
    #[must_use]
    pub fn with_task(mut self, hook: TaskHook) -> Self {
        self.task.insert(hook);
        self
    }

    /// Build a table from exported function names. Unknown names are ignored.
    pub fn from_exports<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut table = Self::new();
        for name in names {
            if let Some(hook) = LifecycleHook::from_export_name(name) {
                table.lifecycle.insert(hook);
            } else if let Some(hook) = TaskHook::from_export_name(name) {
                table.task.insert(hook);
            }
        }
        table
    }

    /// Whether the plugin implements a lifecycle hook.
    #[must_use]
    pub fn has_lifecycle(&self, hook: LifecycleHook) -> bool {
        self.lifecycle.contains(&hook)
    }

    /// Whether the plugin implements a task hook.
    #[must_use]
    pub fn has_task(&self, hook: TaskHook) -> bool {
        self.task.contains(&hook)
    }

    /// Implemented lifecycle hooks.
    pub fn lifecycle_hooks(&self) -> impl Iterator<Item = LifecycleHook> + '_ {
        self.lifecycle.iter().copied()
    }

    /// Implemented task hooks.
    pub fn task_hooks(&self) -> impl Iterator<Item = TaskHook> + '_ {
        self.task.iter().copied()
    }

    /// Whether no hook is implemented.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lifecycle.is_empty() && self.task.is_empty()
    }
}

/// Returns true if `name` is the export name of any lifecycle or task hook.
#[must_use]
pub fn is_hook_name(name: &str) -> bool {
    LifecycleHook::from_export_name(name).is_some() || TaskHook::from_export_name(name).is_some()
}

/// A runnable plugin instance.
///
/// Identity (metadata and capabilities) is not part of this trait: the
/// loader attaches it from the manifest. Implementors only declare which
/// hooks they handle and handle them.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The hooks this plugin implements.
    fn hooks(&self) -> HookTable;

    /// Metadata the plugin declares about itself, if any.
    ///
    /// The loader records it but the manifest always wins.
    fn declared_metadata(&self) -> Option<PluginMetadata> {
        None
    }

    /// Handle a lifecycle transition.
    ///
    /// Only called for hooks present in [`Plugin::hooks`].
    async fn on_lifecycle(&self, event: &LifecycleEvent, ctx: &PluginContext) -> PluginResult<()> {
        let _ = (event, ctx);
        Ok(())
    }

    /// Handle a task hook.
    ///
    /// `args` are the host's arguments; the plugin's own context is passed
    /// alongside. A non-null return value is the plugin's contribution.
    async fn on_task(
        &self,
        hook: TaskHook,
        args: &[Value],
        ctx: &PluginContext,
    ) -> PluginResult<Value> {
        let _ = (hook, args, ctx);
        Ok(Value::Null)
    }
}

impl fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("hooks", &self.hooks())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_id_valid() {
        assert!(PluginId::new("word-count").is_ok());
        assert!(PluginId::new("a").is_ok());
        assert!(PluginId::new("2fa-guard").is_ok());
        assert!(PluginId::new("-edge-").is_ok());
    }

    #[test]
    fn test_plugin_id_invalid() {
        assert!(PluginId::new("").is_err());
        assert!(PluginId::new("Word").is_err());
        assert!(PluginId::new("a_b").is_err());
        assert!(PluginId::new("../x").is_err());
        assert!(PluginId::new("a b").is_err());
    }

    #[test]
    fn test_plugin_id_deserialize_validates() {
        let ok: Result<PluginId, _> = serde_json::from_str("\"good-id\"");
        assert!(ok.is_ok());
        let bad: Result<PluginId, _> = serde_json::from_str("\"../../etc\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_export_names_round_trip() {
        for hook in LifecycleHook::ALL {
            assert_eq!(LifecycleHook::from_export_name(hook.export_name()), Some(hook));
        }
        for hook in TaskHook::ALL {
            assert_eq!(TaskHook::from_export_name(hook.export_name()), Some(hook));
        }
        assert!(!is_hook_name("memory"));
        assert!(is_hook_name("handle_task"));
    }

    #[test]
    fn test_hook_table_from_exports() {
        let table = HookTable::from_exports(["on_enable", "before_task_create", "memory", "_start"]);
        assert!(table.has_lifecycle(LifecycleHook::Enable));
        assert!(!table.has_lifecycle(LifecycleHook::Install));
        assert!(table.has_task(TaskHook::BeforeTaskCreate));
        assert_eq!(table.task_hooks().count(), 1);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_update_payload() {
        let event = LifecycleEvent::Update {
            from: "1.0.0".into(),
            to: "1.1.0".into(),
        };
        assert_eq!(event.hook(), LifecycleHook::Update);
        let payload = event.payload();
        assert_eq!(payload["hook"], "update");
        assert_eq!(payload["to"], "1.1.0");
        assert_eq!(LifecycleEvent::Enable.payload()["hook"], "enable");
    }
}
