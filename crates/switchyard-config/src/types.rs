//! Configuration types for the Switchyard plugin subsystem.
//!
//! Every struct implements [`Default`] with the same values as the embedded
//! `defaults.toml`, so a bare `[section]` header produces a working
//! configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin discovery and trust.
    pub plugins: PluginsSection,
    /// Sandbox quotas.
    pub sandbox: SandboxSection,
    /// Host permission policy applied to every manifest.
    pub permissions: PermissionPolicy,
    /// Hook dispatch settings.
    pub hooks: HooksSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

impl Config {
    /// Resolve the plugins root.
    ///
    /// An empty `plugins.root` falls back to `plugins/` under the platform
    /// data directory, or `.switchyard/plugins` when no home is known.
    #[must_use]
    pub fn plugins_root(&self) -> PathBuf {
        if !self.plugins.root.as_os_str().is_empty() {
            return self.plugins.root.clone();
        }
        directories::ProjectDirs::from("dev", "switchyard", "switchyard").map_or_else(
            || PathBuf::from(".switchyard").join("plugins"),
            |dirs| dirs.data_dir().join("plugins"),
        )
    }
}

/// Where plugins live and which are trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Plugins root directory. Empty means the platform default.
    pub root: PathBuf,
    /// Plugin ids that load on the trusted, non-sandboxed path.
    pub trusted: Vec<String>,
    /// Re-enable plugins the registry marks as enabled after a batch load.
    pub restore_enabled: bool,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            trusted: Vec::new(),
            restore_enabled: true,
        }
    }
}

/// Resource quotas for sandboxed plugins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Wall-clock limit for one sandboxed call, in milliseconds.
    pub timeout_ms: u64,
    /// Limit for instantiating a plugin inside the sandbox, in milliseconds.
    pub load_timeout_ms: u64,
    /// Linear memory cap, in MiB.
    pub memory_limit_mb: u64,
    /// Maximum pending timers per plugin.
    pub max_timers: usize,
    /// Shortest allowed repeating timer period, in milliseconds.
    pub min_interval_ms: u64,
    /// Longest allowed repeating timer period, in milliseconds.
    pub max_interval_ms: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            load_timeout_ms: 5_000,
            memory_limit_mb: 64,
            max_timers: 100,
            min_interval_ms: 10,
            max_interval_ms: 3_600_000,
        }
    }
}

/// Which permission classes the host is willing to grant at all.
///
/// A manifest requesting a class the policy forbids is rejected before any
/// plugin code is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct PermissionPolicy {
    /// Allow `permissions.filesystem`.
    pub allow_filesystem: bool,
    /// Allow `permissions.network`.
    pub allow_network: bool,
    /// Allow `permissions.system.env`.
    pub allow_env: bool,
    /// Allow `permissions.system.exec`. Off by default, so a manifest that
    /// asks for `exec` passes validation with a warning but is rejected by
    /// the manager unless the host enables this.
    pub allow_exec: bool,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            allow_filesystem: true,
            allow_network: true,
            allow_env: true,
            allow_exec: false,
        }
    }
}

impl PermissionPolicy {
    /// A policy that grants every class.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            allow_filesystem: true,
            allow_network: true,
            allow_env: true,
            allow_exec: true,
        }
    }
}

/// Hook dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksSection {
    /// Per-plugin limit for one hook call, in milliseconds. 0 disables it.
    pub timeout_ms: u64,
}

impl Default for HooksSection {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Level filter (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Output format (`pretty`, `compact`, `json`, `full`).
    pub format: String,
    /// Extra `EnvFilter` directives, e.g. `switchyard_plugins=debug`.
    pub directives: Vec<String>,
    /// Write rolling log files here instead of stderr.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
            directory: None,
        }
    }
}
