//! Host API exposed to plugins: task CRUD, scoped events, and UI
//! registration.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use switchyard_core::{Task, TaskId};
use switchyard_events::{EventBus, EventMetadata, EventReceiver, SwitchyardEvent};

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

const EVENT_SOURCE: &str = "plugins";

/// Task operations a host may expose to plugins.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Create a task.
    async fn create_task(&self, task: Task) -> PluginResult<Task>;
    /// Fetch a task.
    async fn get_task(&self, id: &TaskId) -> PluginResult<Option<Task>>;
    /// Replace a task.
    async fn update_task(&self, task: Task) -> PluginResult<Task>;
    /// Delete a task. Returns whether it existed.
    async fn delete_task(&self, id: &TaskId) -> PluginResult<bool>;
    /// List tasks.
    async fn list_tasks(&self) -> PluginResult<Vec<Task>>;
}

/// The default [`TaskApi`]: every call fails with `NotImplemented`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableTaskApi;

#[async_trait]
impl TaskApi for UnavailableTaskApi {
    async fn create_task(&self, _task: Task) -> PluginResult<Task> {
        Err(PluginError::NotImplemented("tasks.create".into()))
    }

    async fn get_task(&self, _id: &TaskId) -> PluginResult<Option<Task>> {
        Err(PluginError::NotImplemented("tasks.get".into()))
    }

    async fn update_task(&self, _task: Task) -> PluginResult<Task> {
        Err(PluginError::NotImplemented("tasks.update".into()))
    }

    async fn delete_task(&self, _id: &TaskId) -> PluginResult<bool> {
        Err(PluginError::NotImplemented("tasks.delete".into()))
    }

    async fn list_tasks(&self) -> PluginResult<Vec<Task>> {
        Err(PluginError::NotImplemented("tasks.list".into()))
    }
}

/// Events scoped to `plugin:<id>:<event>`.
#[derive(Debug, Clone)]
pub struct PluginEvents {
    plugin_id: PluginId,
    bus: EventBus,
}

impl PluginEvents {
    /// Create the facade for `plugin_id`.
    #[must_use]
    pub fn new(plugin_id: PluginId, bus: EventBus) -> Self {
        Self { plugin_id, bus }
    }

    /// Full topic for one of this plugin's events.
    #[must_use]
    pub fn topic(&self, event: &str) -> String {
        format!("plugin:{}:{event}", self.plugin_id)
    }

    /// Publish a message. Returns the number of receivers.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        self.bus.publish(SwitchyardEvent::PluginMessage {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: self.plugin_id.to_string(),
            topic: self.topic(event),
            payload,
        })
    }

    /// Subscribe to one of this plugin's events. `*` subscribes to all of them.
    #[must_use]
    pub fn subscribe(&self, event: &str) -> EventReceiver {
        self.bus.subscribe_topic(self.topic(event))
    }
}

/// UI registration requests, re-emitted on the bus for the shell.
#[derive(Debug, Clone)]
pub struct PluginUi {
    plugin_id: PluginId,
    bus: EventBus,
}

impl PluginUi {
    /// Create the facade for `plugin_id`.
    #[must_use]
    pub fn new(plugin_id: PluginId, bus: EventBus) -> Self {
        Self { plugin_id, bus }
    }

    /// Register a component.
    pub fn register_component(&self, name: impl Into<String>, definition: Value) {
        self.bus.publish(SwitchyardEvent::UiComponentRegistered {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: self.plugin_id.to_string(),
            name: name.into(),
            definition,
        });
    }

    /// Register a route rendering `component`.
    pub fn register_route(&self, path: impl Into<String>, component: impl Into<String>) {
        self.bus.publish(SwitchyardEvent::UiRouteRegistered {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: self.plugin_id.to_string(),
            path: path.into(),
            component: component.into(),
        });
    }

    /// Register a menu item pointing at `target`.
    pub fn register_menu_item(&self, label: impl Into<String>, target: impl Into<String>) {
        self.bus.publish(SwitchyardEvent::UiMenuItemRegistered {
            metadata: EventMetadata::new(EVENT_SOURCE),
            plugin_id: self.plugin_id.to_string(),
            label: label.into(),
            target: target.into(),
        });
    }
}

/// Everything a plugin can ask of the host.
#[derive(Clone)]
pub struct PluginApi {
    /// Task operations.
    pub tasks: Arc<dyn TaskApi>,
    /// Scoped events.
    pub events: PluginEvents,
    /// UI registration.
    pub ui: PluginUi,
}

impl PluginApi {
    /// Build the API for `plugin_id`.
    #[must_use]
    pub fn new(plugin_id: &PluginId, bus: EventBus, tasks: Arc<dyn TaskApi>) -> Self {
        Self {
            tasks,
            events: PluginEvents::new(plugin_id.clone(), bus.clone()),
            ui: PluginUi::new(plugin_id.clone(), bus),
        }
    }
}

impl fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginApi")
            .field("events", &self.events)
            .field("ui", &self.ui)
            .finish_non_exhaustive()
    }
}
