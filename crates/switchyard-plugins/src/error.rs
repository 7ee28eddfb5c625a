//! Plugin error types.

use std::path::PathBuf;

/// Errors from plugin operations.
///
/// Validation, load, sandbox and lifecycle errors reach the administrative
/// caller. Hook failures are only ever logged and collected by the manager.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Manifest, permission, schema, or code-scan validation failed.
    #[error("validation failed for {plugin}: {}", errors.join("; "))]
    ValidationFailed {
        /// Plugin id or directory being validated.
        plugin: String,
        /// Blocking problems.
        errors: Vec<String>,
        /// Non-blocking problems found alongside.
        warnings: Vec<String>,
    },

    /// Failed to read or parse a plugin manifest file.
    #[error("manifest parse error in {path}: {message}")]
    ManifestParseError {
        /// Path to the manifest file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// The plugin ID is invalid.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// Entry point resolution or instantiation failed.
    #[error("plugin load failed: {plugin_id} - {message}")]
    LoadFailed {
        /// The plugin that failed to load.
        plugin_id: String,
        /// Failure reason.
        message: String,
    },

    /// Timeout or fault inside isolated execution.
    #[error("sandbox error in {plugin_id}: {message}")]
    SandboxError {
        /// The plugin whose sandbox faulted.
        plugin_id: String,
        /// Failure reason.
        message: String,
    },

    /// The sandbox module loader refused a module.
    #[error("module '{module}' denied for {plugin_id}: {reason}")]
    ModuleDenied {
        /// Requesting plugin.
        plugin_id: String,
        /// Requested module name.
        module: String,
        /// Why it was refused.
        reason: String,
    },

    /// The plugin already has the maximum number of pending timers.
    #[error("timer limit reached for {plugin_id}: at most {limit} pending timers")]
    TimerLimit {
        /// Plugin that hit the cap.
        plugin_id: String,
        /// The cap.
        limit: usize,
    },

    /// Operation on an unknown id or an invalid state transition.
    #[error("lifecycle error for {plugin_id}: {message}")]
    Lifecycle {
        /// Target plugin.
        plugin_id: String,
        /// What went wrong.
        message: String,
    },

    /// A plugin hook failed.
    #[error("hook {hook} failed in {plugin_id}: {message}")]
    HookFailed {
        /// Plugin whose hook failed.
        plugin_id: String,
        /// Hook export name.
        hook: String,
        /// Failure reason.
        message: String,
    },

    /// No registry entry for this id.
    #[error("plugin not found in registry: {0}")]
    NotFound(String),

    /// Registry read/write failure.
    #[error("registry error at {path}: {message}")]
    Registry {
        /// Path to the registry file.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// Plugin storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Plugin configuration failure.
    #[error("config error: {0}")]
    Config(String),

    /// The host has not provided this capability.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    /// Wrap any displayable failure as a sandbox error.
    pub(crate) fn sandbox(plugin_id: &str, message: impl std::fmt::Display) -> Self {
        Self::SandboxError {
            plugin_id: plugin_id.to_owned(),
            message: message.to_string(),
        }
    }

    /// Wrap any displayable failure as a load error.
    pub(crate) fn load(plugin_id: &str, message: impl std::fmt::Display) -> Self {
        Self::LoadFailed {
            plugin_id: plugin_id.to_owned(),
            message: message.to_string(),
        }
    }

    /// Build a lifecycle error.
    pub(crate) fn lifecycle(plugin_id: &str, message: impl Into<String>) -> Self {
        Self::Lifecycle {
            plugin_id: plugin_id.to_owned(),
            message: message.into(),
        }
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
