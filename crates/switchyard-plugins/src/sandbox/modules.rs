//! Restricted module loader.
//!
//! The allow-list built here is the capability boundary for a sandboxed
//! plugin. It holds the safe catalog plus the permission-gated groups
//! granted when the context was created. Any other name fails closed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginPermissions;

/// Modules every plugin may load.
pub const SAFE_MODULES: &[&str] = &["path", "url", "util", "events", "crypto", "json", "time"];

/// Modules that require a granted permission.
pub const GATED_MODULES: &[(&str, ModuleGroup)] = &[
    ("fs", ModuleGroup::Filesystem),
    ("http", ModuleGroup::Network),
    ("net", ModuleGroup::Network),
    ("env", ModuleGroup::Environment),
    ("process", ModuleGroup::Process),
];

/// Capability class of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleGroup {
    /// Always allowed.
    Safe,
    /// Needs `permissions.filesystem`.
    Filesystem,
    /// Needs `permissions.network.hosts`.
    Network,
    /// Needs `permissions.system.env`.
    Environment,
    /// Needs `permissions.system.exec`.
    Process,
}

impl ModuleGroup {
    fn granted_by(self, permissions: &PluginPermissions) -> bool {
        match self {
            Self::Safe => true,
            Self::Filesystem => permissions.wants_filesystem(),
            Self::Network => permissions.wants_network(),
            Self::Environment => permissions.wants_env(),
            Self::Process => permissions.wants_exec(),
        }
    }
}

impl fmt::Display for ModuleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Safe => "safe",
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Environment => "environment",
            Self::Process => "process",
        };
        f.write_str(name)
    }
}

/// A module handed to a plugin by `sy_require`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostModule {
    /// Module name.
    pub name: String,
    /// Capability class.
    pub group: ModuleGroup,
}

/// Per-context module loader with a result cache.
#[derive(Debug)]
pub struct ModuleLoader {
    plugin_id: String,
    allowed: BTreeMap<String, ModuleGroup>,
    cache: Mutex<BTreeMap<String, HostModule>>,
}

impl ModuleLoader {
    /// Build the allow-list for a plugin.
    ///
    /// `allowed_modules` narrows the safe baseline; names outside the safe
    /// catalog are ignored. Gated groups come only from `permissions`, or
    /// from `trusted`, which grants every group.
    #[must_use]
    pub fn new(
        plugin_id: &str,
        permissions: &PluginPermissions,
        allowed_modules: Option<&[String]>,
        trusted: bool,
    ) -> Self {
        let safe: BTreeSet<&str> = match allowed_modules {
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    let found = SAFE_MODULES.iter().copied().find(|s| *s == name.as_str());
                    if found.is_none() {
                        warn!(
                            plugin_id,
                            module = %name,
                            "Ignoring allowed module outside the safe catalog"
                        );
                    }
                    found
                })
                .collect(),
            None => SAFE_MODULES.iter().copied().collect(),
        };

        let mut allowed: BTreeMap<String, ModuleGroup> = safe
            .into_iter()
            .map(|name| (name.to_owned(), ModuleGroup::Safe))
            .collect();
        for (name, group) in GATED_MODULES {
            if trusted || group.granted_by(permissions) {
                allowed.insert((*name).to_owned(), *group);
            }
        }

        debug!(
            plugin_id,
            modules = ?allowed.keys().collect::<Vec<_>>(),
            "Built module allow-list"
        );

        Self {
            plugin_id: plugin_id.to_owned(),
            allowed,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whether `name` is on the allow-list.
    #[must_use]
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.contains_key(name)
    }

    /// Allowed module names, sorted.
    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed.keys().map(String::as_str)
    }

    /// Resolve a module.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ModuleDenied`] for path-like names and for any
    /// name not on the allow-list.
    pub fn require(&self, name: &str) -> PluginResult<HostModule> {
        if let Some(reason) = path_like(name) {
            return Err(self.denied(name, reason));
        }

        if let Some(module) = self.cache.lock().ok().and_then(|c| c.get(name).cloned()) {
            return Ok(module);
        }

        let Some(group) = self.allowed.get(name).copied() else {
            let reason = match GATED_MODULES.iter().find(|(n, _)| *n == name) {
                Some((_, group)) => format!("requires the {group} permission"),
                None => "not on the allow-list".to_owned(),
            };
            return Err(self.denied(name, reason));
        };

        let module = HostModule {
            name: name.to_owned(),
            group,
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name.to_owned(), module.clone());
        }
        Ok(module)
    }

    /// Number of cached resolutions.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or_default()
    }

    /// Drop every cached resolution.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn denied(&self, name: &str, reason: impl Into<String>) -> PluginError {
        PluginError::ModuleDenied {
            plugin_id: self.plugin_id.clone(),
            module: name.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Why a name looks like a path, if it does.
fn path_like(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("empty module name");
    }
    if crate::validator::has_parent_segment(name) {
        return Some("parent-directory segments are not allowed");
    }
    if crate::validator::is_absolute_like(name) {
        return Some("absolute paths are not allowed");
    }
    None
}
