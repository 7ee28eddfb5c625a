//! Plugins root layout.
//!
//! ```text
//! <root>/registry.json
//! <root>/<id>/plugin.json
//! <root>/<id>/<main>
//! <root>/<id>/config.json
//! <root>/<id>/storage/<key>.json
//! ```

use std::path::{Path, PathBuf};

/// Registry file name under the plugins root.
pub const REGISTRY_FILE: &str = "registry.json";

/// Per-plugin configuration file name.
pub const CONFIG_FILE: &str = "config.json";

/// Per-plugin storage directory name.
pub const STORAGE_DIR: &str = "storage";

/// Directory name skipped during discovery.
pub const CACHE_DIR: &str = ".cache";

/// The directory for one plugin. Does not create it.
#[must_use]
pub fn plugin_dir(root: &Path, plugin_id: &str) -> PathBuf {
    root.join(plugin_id)
}

/// The storage directory for one plugin.
#[must_use]
pub fn storage_dir(root: &Path, plugin_id: &str) -> PathBuf {
    plugin_dir(root, plugin_id).join(STORAGE_DIR)
}

/// The persisted configuration file for one plugin.
#[must_use]
pub fn config_path(root: &Path, plugin_id: &str) -> PathBuf {
    plugin_dir(root, plugin_id).join(CONFIG_FILE)
}

/// The registry file under `root`.
#[must_use]
pub fn registry_path(root: &Path) -> PathBuf {
    root.join(REGISTRY_FILE)
}

/// The advisory lock file guarding the registry.
#[must_use]
pub fn registry_lock_path(root: &Path) -> PathBuf {
    root.join(format!("{REGISTRY_FILE}.lk"))
}
