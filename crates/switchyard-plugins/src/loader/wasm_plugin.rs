//! [`Plugin`] implementation backed by a sandboxed WebAssembly instance.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::PluginContext;
use crate::error::PluginResult;
use crate::manifest::PluginMetadata;
use crate::plugin::{HookTable, LifecycleEvent, Plugin, TaskHook};
use crate::sandbox::SandboxInstance;

/// A plugin whose hooks are exports of a WebAssembly module.
///
/// Every hook receives `{"args": [...]}` and may return JSON. Lifecycle
/// hooks receive the event payload as their single argument.
pub struct WasmPlugin {
    instance: SandboxInstance,
    hooks: HookTable,
    declared: Option<PluginMetadata>,
}

impl WasmPlugin {
    pub(crate) fn new(
        instance: SandboxInstance,
        hooks: HookTable,
        declared: Option<PluginMetadata>,
    ) -> Self {
        Self {
            instance,
            hooks,
            declared,
        }
    }

    async fn invoke(&self, export: &str, args: Value, ctx: &PluginContext) -> PluginResult<Value> {
        self.instance.set_plugin_context(ctx.clone())?;
        let input = serde_json::to_vec(&json!({ "args": args }))?;
        let output = self.instance.call(export, input).await?;
        Ok(decode_output(&output))
    }
}

#[async_trait]
impl Plugin for WasmPlugin {
    fn hooks(&self) -> HookTable {
        self.hooks.clone()
    }

    fn declared_metadata(&self) -> Option<PluginMetadata> {
        self.declared.clone()
    }

    async fn on_lifecycle(&self, event: &LifecycleEvent, ctx: &PluginContext) -> PluginResult<()> {
        self.invoke(event.hook().export_name(), json!([event.payload()]), ctx)
            .await
            .map(|_| ())
    }

    async fn on_task(
        &self,
        hook: TaskHook,
        args: &[Value],
        ctx: &PluginContext,
    ) -> PluginResult<Value> {
        self.invoke(hook.export_name(), Value::Array(args.to_vec()), ctx)
            .await
    }
}

/// Empty output is `null`; output that is not JSON is returned as a string.
pub(crate) fn decode_output(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

impl std::fmt::Debug for WasmPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmPlugin")
            .field("plugin_id", &self.instance.plugin_id())
            .field("hooks", &self.hooks)
            .field("has_declared_metadata", &self.declared.is_some())
            .finish_non_exhaustive()
    }
}
