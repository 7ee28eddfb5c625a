//! Event types for the Switchyard event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Correlation ID for tracing related events.
    pub correlation_id: Option<Uuid>,
    /// Source component that generated the event.
    pub source: String,
}

impl EventMetadata {
    /// Create new event metadata.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            source: source.into(),
        }
    }

    /// Set correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new("unknown")
    }
}

/// All events emitted by the Switchyard plugin subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchyardEvent {
    // ========== Plugin Lifecycle ==========
    /// A plugin was loaded into memory.
    PluginLoaded {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin ID.
        plugin_id: String,
        /// Plugin version.
        version: String,
        /// Whether the plugin runs inside the sandbox.
        sandboxed: bool,
    },

    /// A plugin failed to load.
    PluginFailed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin directory that failed.
        path: String,
        /// Error message.
        error: String,
    },

    /// A plugin was enabled.
    PluginEnabled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin ID.
        plugin_id: String,
    },

    /// A plugin was disabled.
    PluginDisabled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin ID.
        plugin_id: String,
    },

    /// A plugin was uninstalled.
    PluginUninstalled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin ID.
        plugin_id: String,
    },

    /// A plugin's version changed.
    PluginUpdated {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin ID.
        plugin_id: String,
        /// Previous version.
        from_version: String,
        /// New version.
        to_version: String,
    },

    // ========== Plugin Messaging ==========
    /// A message a plugin emitted on its scoped topic.
    PluginMessage {
        /// Event metadata.
        metadata: EventMetadata,
        /// Emitting plugin ID.
        plugin_id: String,
        /// Full topic, `plugin:<id>:<event>`.
        topic: String,
        /// Message payload.
        payload: Value,
    },

    // ========== UI Registration ==========
    /// A plugin asked the UI shell to render a component.
    UiComponentRegistered {
        /// Event metadata.
        metadata: EventMetadata,
        /// Requesting plugin ID.
        plugin_id: String,
        /// Component name.
        name: String,
        /// Component definition, opaque to the host.
        definition: Value,
    },

    /// A plugin asked the UI shell to mount a route.
    UiRouteRegistered {
        /// Event metadata.
        metadata: EventMetadata,
        /// Requesting plugin ID.
        plugin_id: String,
        /// Route path.
        path: String,
        /// Component rendered at the route.
        component: String,
    },

    /// A plugin asked the UI shell to add a menu item.
    UiMenuItemRegistered {
        /// Event metadata.
        metadata: EventMetadata,
        /// Requesting plugin ID.
        plugin_id: String,
        /// Menu item label.
        label: String,
        /// Route or action the item points at.
        target: String,
    },
}

impl SwitchyardEvent {
    /// Get the event metadata.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Self::PluginLoaded { metadata, .. }
            | Self::PluginFailed { metadata, .. }
            | Self::PluginEnabled { metadata, .. }
            | Self::PluginDisabled { metadata, .. }
            | Self::PluginUninstalled { metadata, .. }
            | Self::PluginUpdated { metadata, .. }
            | Self::PluginMessage { metadata, .. }
            | Self::UiComponentRegistered { metadata, .. }
            | Self::UiRouteRegistered { metadata, .. }
            | Self::UiMenuItemRegistered { metadata, .. } => metadata,
        }
    }

    /// Get the event type name.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PluginLoaded { .. } => "plugin_loaded",
            Self::PluginFailed { .. } => "plugin_failed",
            Self::PluginEnabled { .. } => "plugin_enabled",
            Self::PluginDisabled { .. } => "plugin_disabled",
            Self::PluginUninstalled { .. } => "plugin_uninstalled",
            Self::PluginUpdated { .. } => "plugin_updated",
            Self::PluginMessage { .. } => "plugin_message",
            Self::UiComponentRegistered { .. } => "ui_component_registered",
            Self::UiRouteRegistered { .. } => "ui_route_registered",
            Self::UiMenuItemRegistered { .. } => "ui_menu_item_registered",
        }
    }

    /// The plugin this event concerns, if any.
    #[must_use]
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::PluginLoaded { plugin_id, .. }
            | Self::PluginEnabled { plugin_id, .. }
            | Self::PluginDisabled { plugin_id, .. }
            | Self::PluginUninstalled { plugin_id, .. }
            | Self::PluginUpdated { plugin_id, .. }
            | Self::PluginMessage { plugin_id, .. }
            | Self::UiComponentRegistered { plugin_id, .. }
            | Self::UiRouteRegistered { plugin_id, .. }
            | Self::UiMenuItemRegistered { plugin_id, .. } => Some(plugin_id),
            Self::PluginFailed { .. } => None,
        }
    }

    /// Topic of a plugin message. Other events carry no topic.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::PluginMessage { topic, .. } => Some(topic),
            _ => None,
        }
    }
}
