//! Extism host functions for sandboxed plugins.
//!
//! | Function | Module gate | Async bridge |
//! |----------|-------------|--------------|
//! | `sy_log` | No | No |
//! | `sy_require` | allow-list | No |
//! | `sy_now` | `time` | No |
//! | `sy_set_timeout` | `time` | No |
//! | `sy_set_interval` | `time` | No |
//! | `sy_clear_timer` | `time` | No |
//! | `sy_env_get` | `env` + declared name | No |
//! | `sy_storage_get` | No | Yes |
//! | `sy_storage_set` | No | Yes |
//! | `sy_config_get` | No | No |
//! | `sy_emit` | `events` | No |
//!
//! A denied call returns an error, which traps the guest. Async operations
//! are bridged with `Handle::block_on`; every guest call runs on the
//! blocking pool, so this never blocks a runtime worker.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use extism::{CurrentPlugin, Error, PTR, UserData, Val, ValType};
use serde_json::Value;
use tracing::warn;

use super::SandboxContext;
use super::host_state::HostState;
use super::timers::TimerCallback;
use crate::context::PluginContext;

/// Snapshot what a host function needs, then release the state lock
/// before doing any work.
fn snapshot<T>(
    user_data: &UserData<HostState>,
    f: impl FnOnce(&HostState) -> T,
) -> Result<T, Error> {
    let shared = user_data.get()?;
    let state = shared
        .lock()
        .map_err(|e| Error::msg(format!("host state lock poisoned: {e}")))?;
    Ok(f(&state))
}

fn gate(context: &SandboxContext, module: &str) -> Result<(), Error> {
    context
        .require(module)
        .map(|_| ())
        .map_err(|e| Error::msg(e.to_string()))
}

fn plugin_ctx(ctx: Option<PluginContext>, what: &str) -> Result<PluginContext, Error> {
    ctx.ok_or_else(|| Error::msg(format!("{what} is unavailable before the plugin is registered")))
}

fn write_string(plugin: &mut CurrentPlugin, outputs: &mut [Val], s: &str) -> Result<(), Error> {
    let mem = plugin.memory_new(s)?;
    outputs[0] = plugin.memory_to_val(mem);
    Ok(())
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

// ---------------------------------------------------------------------------
// sy_log(level, message)
// ---------------------------------------------------------------------------

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_log_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    _outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let level: String = plugin.memory_get_val(&inputs[0])?;
    let message: String = plugin.memory_get_val(&inputs[1])?;
    let context = snapshot(&user_data, |s| Arc::clone(&s.context))?;
    context.logger().log(&level, &message);
    Ok(())
}

// ---------------------------------------------------------------------------
// sy_require(name) -> module_json
// ---------------------------------------------------------------------------

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_require_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let name: String = plugin.memory_get_val(&inputs[0])?;
    let context = snapshot(&user_data, |s| Arc::clone(&s.context))?;
    let module = context.require(&name).map_err(|e| {
        warn!(plugin_id = %context.plugin_id(), module = %name, error = %e, "Module denied");
        Error::msg(e.to_string())
    })?;
    let json = serde_json::to_string(&module)?;
    write_string(plugin, outputs, &json)
}

// ---------------------------------------------------------------------------
// sy_now() -> ms
// ---------------------------------------------------------------------------

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_now_impl(
    _plugin: &mut CurrentPlugin,
    _inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let context = snapshot(&user_data, |s| Arc::clone(&s.context))?;
    gate(&context, "time")?;
    outputs[0] = Val::I64(to_i64(context.now_ms()));
    Ok(())
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// A callback that invokes `export` on the instance, if it is still alive.
fn timer_callback(
    plugin_id: String,
    instance: Option<Weak<Mutex<extism::Plugin>>>,
    export: String,
) -> TimerCallback {
    Arc::new(move || {
        let Some(instance) = instance.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let plugin_id = plugin_id.clone();
        let export = export.clone();
        tokio::task::spawn_blocking(move || {
            let result = instance
                .lock()
                .map_err(|e| format!("instance lock poisoned: {e}"))
                .and_then(|mut plugin| {
                    plugin
                        .call::<&str, Vec<u8>>(&export, "")
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                });
            if let Err(error) = result {
                warn!(plugin_id = %plugin_id, export = %export, %error, "Timer callback failed");
            }
        });
    })
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_set_timeout_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let export: String = plugin.memory_get_val(&inputs[0])?;
    let delay = to_duration(inputs[1].unwrap_i64());
    let (context, instance) =
        snapshot(&user_data, |s| (Arc::clone(&s.context), s.instance.clone()))?;
    gate(&context, "time")?;

    let callback = timer_callback(context.plugin_id().to_owned(), instance, export);
    let id = context
        .timers()
        .set_timeout(delay, callback)
        .map_err(|e| Error::msg(e.to_string()))?;
    outputs[0] = Val::I64(to_i64(id));
    Ok(())
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_set_interval_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let export: String = plugin.memory_get_val(&inputs[0])?;
    let period = to_duration(inputs[1].unwrap_i64());
    let (context, instance) =
        snapshot(&user_data, |s| (Arc::clone(&s.context), s.instance.clone()))?;
    gate(&context, "time")?;

    let callback = timer_callback(context.plugin_id().to_owned(), instance, export);
    let id = context
        .timers()
        .set_interval(period, callback)
        .map_err(|e| Error::msg(e.to_string()))?;
    outputs[0] = Val::I64(to_i64(id));
    Ok(())
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_clear_timer_impl(
    _plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let id = u64::try_from(inputs[0].unwrap_i64()).unwrap_or(0);
    let context = snapshot(&user_data, |s| Arc::clone(&s.context))?;
    let cleared = context.timers().clear(id);
    outputs[0] = Val::I64(i64::from(cleared));
    Ok(())
}

// ---------------------------------------------------------------------------
// sy_env_get(name) -> value
// ---------------------------------------------------------------------------

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_env_get_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let name: String = plugin.memory_get_val(&inputs[0])?;
    let context = snapshot(&user_data, |s| Arc::clone(&s.context))?;
    let value = context
        .env_var(&name)
        .map_err(|e| Error::msg(e.to_string()))?
        .unwrap_or_default();
    write_string(plugin, outputs, &value)
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_storage_get_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let key: String = plugin.memory_get_val(&inputs[0])?;
    let (ctx, handle) = snapshot(&user_data, |s| (s.plugin_ctx.clone(), s.runtime_handle.clone()))?;
    let ctx = plugin_ctx(ctx, "storage")?;
    let handle = handle.ok_or_else(|| Error::msg("storage requires a tokio runtime"))?;

    let value = handle
        .block_on(ctx.storage.get(&key))
        .map_err(|e| Error::msg(format!("storage_get failed: {e}")))?;
    let json = match value {
        Some(v) => serde_json::to_string(&v)?,
        None => String::new(),
    };
    write_string(plugin, outputs, &json)
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_storage_set_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    _outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let key: String = plugin.memory_get_val(&inputs[0])?;
    let raw: String = plugin.memory_get_val(&inputs[1])?;
    let (ctx, handle) = snapshot(&user_data, |s| (s.plugin_ctx.clone(), s.runtime_handle.clone()))?;
    let ctx = plugin_ctx(ctx, "storage")?;
    let handle = handle.ok_or_else(|| Error::msg("storage requires a tokio runtime"))?;

    let value = parse_lenient(raw);
    handle
        .block_on(ctx.storage.set(&key, &value))
        .map_err(|e| Error::msg(format!("storage_set failed: {e}")))
}

// ---------------------------------------------------------------------------
// sy_config_get(key) -> value_json
// ---------------------------------------------------------------------------

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_config_get_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let key: String = plugin.memory_get_val(&inputs[0])?;
    let ctx = snapshot(&user_data, |s| s.plugin_ctx.clone())?;
    let ctx = plugin_ctx(ctx, "config")?;
    let json = match ctx.config.get(&key) {
        Some(v) => serde_json::to_string(&v)?,
        None => String::new(),
    };
    write_string(plugin, outputs, &json)
}

// ---------------------------------------------------------------------------
// sy_emit(event, payload_json)
// ---------------------------------------------------------------------------

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn sy_emit_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    _outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let event: String = plugin.memory_get_val(&inputs[0])?;
    let raw: String = plugin.memory_get_val(&inputs[1])?;
    let (context, ctx) = snapshot(&user_data, |s| (Arc::clone(&s.context), s.plugin_ctx.clone()))?;
    gate(&context, "events")?;
    let ctx = plugin_ctx(ctx, "events")?;
    ctx.api.events.emit(&event, parse_lenient(raw));
    Ok(())
}

/// JSON if it parses, otherwise the raw string.
fn parse_lenient(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register every `sy_*` host function in the `extism:host/user` namespace.
pub(crate) fn register_host_functions(
    builder: extism::PluginBuilder,
    user_data: UserData<HostState>,
) -> extism::PluginBuilder {
    builder
        .with_function("sy_log", [PTR, PTR], [], user_data.clone(), sy_log_impl)
        .with_function("sy_require", [PTR], [PTR], user_data.clone(), sy_require_impl)
        .with_function("sy_now", [], [ValType::I64], user_data.clone(), sy_now_impl)
        .with_function(
            "sy_set_timeout",
            [PTR, ValType::I64],
            [ValType::I64],
            user_data.clone(),
            sy_set_timeout_impl,
        )
        .with_function(
            "sy_set_interval",
            [PTR, ValType::I64],
            [ValType::I64],
            user_data.clone(),
            sy_set_interval_impl,
        )
        .with_function(
            "sy_clear_timer",
            [ValType::I64],
            [ValType::I64],
            user_data.clone(),
            sy_clear_timer_impl,
        )
        .with_function("sy_env_get", [PTR], [PTR], user_data.clone(), sy_env_get_impl)
        .with_function(
            "sy_storage_get",
            [PTR],
            [PTR],
            user_data.clone(),
            sy_storage_get_impl,
        )
        .with_function(
            "sy_storage_set",
            [PTR, PTR],
            [],
            user_data.clone(),
            sy_storage_set_impl,
        )
        .with_function(
            "sy_config_get",
            [PTR],
            [PTR],
            user_data.clone(),
            sy_config_get_impl,
        )
        .with_function("sy_emit", [PTR, PTR], [], user_data, sy_emit_impl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lenient() {
        assert_eq!(parse_lenient("{\"a\":1}".into()), serde_json::json!({"a": 1}));
        assert_eq!(parse_lenient("plain".into()), Value::String("plain".into()));
    }

    #[test]
    fn test_duration_conversion_clamps_negative() {
        assert_eq!(to_duration(-5), Duration::ZERO);
        assert_eq!(to_duration(250), Duration::from_millis(250));
        assert_eq!(to_i64(u64::MAX), i64::MAX);
    }
}
