//! Durable catalogue of installed plugins.
//!
//! The registry lives at `<root>/registry.json` as a JSON array of
//! [`PluginRegistryEntry`] records. It outlives loading: a plugin that is
//! known to the registry but not loaded is simply installed and idle.
//!
//! Every mutation rewrites the whole file. Writes go to a temporary file in
//! the same directory, are synced, and are renamed into place while an
//! exclusive advisory lock is held on `registry.json.lk`.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::manifest::{MANIFEST_FILE, PluginManifest};
use crate::plugin_dirs::{self, CACHE_DIR};

/// One installed plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRegistryEntry {
    /// Plugin ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// Plugin directory.
    pub path: PathBuf,
    /// Whether the plugin should be enabled.
    pub enabled: bool,
    /// First registration.
    pub installed_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a registry entry. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginRegistryUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New version.
    pub version: Option<String>,
    /// New plugin directory.
    pub path: Option<PathBuf>,
    /// New enabled flag.
    pub enabled: Option<bool>,
}

impl PluginRegistryUpdate {
    fn apply(self, entry: &mut PluginRegistryEntry) {
        if let Some(name) = self.name {
            entry.name = name;
        }
        if let Some(version) = self.version {
            entry.version = version;
        }
        if let Some(path) = self.path {
            entry.path = path;
        }
        if let Some(enabled) = self.enabled {
            entry.enabled = enabled;
        }
        entry.updated_at = Utc::now();
    }
}

/// Disk-backed plugin catalogue.
///
/// Entries keep registration order. All methods are synchronous; the file
/// is small and the lock is uncontended in a single process.
#[derive(Debug)]
pub struct PluginRegistry {
    root: PathBuf,
    entries: Mutex<Vec<PluginRegistryEntry>>,
}

impl PluginRegistry {
    /// Create an empty registry for `root`. Nothing is read until
    /// [`load`](Self::load).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Create a registry and load it from disk.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn open(root: impl Into<PathBuf>) -> PluginResult<Self> {
        let registry = Self::new(root);
        registry.load()?;
        Ok(registry)
    }

    /// Plugins root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `registry.json`.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        plugin_dirs::registry_path(&self.root)
    }

    fn entries(&self) -> MutexGuard<'_, Vec<PluginRegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the in-memory catalogue with the file contents.
    ///
    /// A missing file is an empty registry. Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Registry`] if the file exists but cannot be
    /// read or parsed.
    pub fn load(&self) -> PluginResult<usize> {
        let path = self.path();
        let _lock = acquire_lock(&self.root, LockMode::Shared)?;

        let loaded: Vec<PluginRegistryEntry> = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| PluginError::Registry {
                path: path.clone(),
                message: format!("failed to parse registry: {e}"),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(PluginError::Registry {
                    path,
                    message: format!("failed to read registry: {e}"),
                });
            },
        };

        let count = loaded.len();
        *self.entries() = loaded;
        debug!(path = %path.display(), entries = count, "Loaded plugin registry");
        Ok(count)
    }

    /// Plugin directories under the root, sorted by path.
    ///
    /// Creates the root if missing. Only subdirectories containing a
    /// `plugin.json` count; the cache directory is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the root cannot be created or listed.
    pub fn discover_plugins(&self) -> PluginResult<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.root)?;

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "Skipping unreadable entry");
                    continue;
                },
            };
            if entry.file_name() == CACHE_DIR {
                continue;
            }
            let path = entry.path();
            if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
                found.push(path);
            }
        }
        found.sort();

        debug!(root = %self.root.display(), count = found.len(), "Discovered plugins");
        Ok(found)
    }

    /// Record `manifest` as installed at `path`.
    ///
    /// A known id is refreshed (name, version, path) and keeps its enabled
    /// flag and install time. Returns `true` on first registration.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Registry`] if the registry cannot be written.
    pub fn register_plugin(&self, manifest: &PluginManifest, path: &Path) -> PluginResult<bool> {
        let meta = &manifest.metadata;
        self.mutate(|entries| {
            if let Some(entry) = entries.iter_mut().find(|e| e.id == meta.id) {
                PluginRegistryUpdate {
                    name: Some(meta.name.clone()),
                    version: Some(meta.version.clone()),
                    path: Some(path.to_path_buf()),
                    enabled: None,
                }
                .apply(entry);
                return Ok(false);
            }

            let now = Utc::now();
            entries.push(PluginRegistryEntry {
                id: meta.id.clone(),
                name: meta.name.clone(),
                version: meta.version.clone(),
                path: path.to_path_buf(),
                enabled: false,
                installed_at: now,
                updated_at: now,
            });
            Ok(true)
        })
        .inspect(|first| {
            if *first {
                info!(plugin_id = %meta.id, version = %meta.version, "Registered plugin");
            }
        })
    }

    /// Drop the entry for `id`, leaving files alone. Returns whether it
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Registry`] if the registry cannot be written.
    pub fn unregister_plugin(&self, id: &str) -> PluginResult<bool> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            Ok(entries.len() != before)
        })
    }

    /// Apply `update` to the entry for `id` and return the result.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for an unknown id, or
    /// [`PluginError::Registry`] if the registry cannot be written.
    pub fn update_plugin(
        &self,
        id: &str,
        update: PluginRegistryUpdate,
    ) -> PluginResult<PluginRegistryEntry> {
        self.mutate(|entries| {
            let entry = entries
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| PluginError::NotFound(id.to_owned()))?;
            update.apply(entry);
            Ok(entry.clone())
        })
    }

    /// Persist the enabled flag for `id`.
    ///
    /// # Errors
    ///
    /// See [`update_plugin`](Self::update_plugin).
    pub fn set_plugin_enabled(&self, id: &str, enabled: bool) -> PluginResult<()> {
        self.update_plugin(
            id,
            PluginRegistryUpdate {
                enabled: Some(enabled),
                ..PluginRegistryUpdate::default()
            },
        )
        .map(|_| ())
    }

    /// Delete the plugin directory and its data directory `<root>/<id>`,
    /// then drop the entry. A data directory that is another plugin's
    /// install directory is left alone.
    ///
    /// Directory removal is best effort; a failure is logged and the entry
    /// is still dropped. Returns whether an entry existed.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Registry`] if the registry cannot be written.
    pub fn remove_plugin(&self, id: &str) -> PluginResult<bool> {
        let data_dir = plugin_dirs::plugin_dir(&self.root, id);
        let (registered, owned_by_other) = {
            let entries = self.entries();
            let registered = entries.iter().find(|e| e.id == id).map(|e| e.path.clone());
            let owned_by_other = entries.iter().any(|e| e.id != id && e.path == data_dir);
            (registered, owned_by_other)
        };

        if let Some(dir) = &registered {
            remove_dir_logged(id, dir);
        }
        // Storage and config live under `<root>/<id>` even when the plugin
        // was installed elsewhere.
        if registered.as_ref() != Some(&data_dir) && !owned_by_other {
            remove_dir_logged(id, &data_dir);
        }

        self.unregister_plugin(id)
    }

    /// The entry for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PluginRegistryEntry> {
        self.entries().iter().find(|e| e.id == id).cloned()
    }

    /// All entries in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<PluginRegistryEntry> {
        self.entries().clone()
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries().iter().any(|e| e.id == id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Run `f` on a copy of the entries, write the copy, then commit it.
    ///
    /// The in-memory state only changes if the write succeeds.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<PluginRegistryEntry>) -> PluginResult<T>,
    ) -> PluginResult<T> {
        let mut guard = self.entries();
        let mut next = guard.clone();
        let out = f(&mut next)?;

        if let Err(e) = self.save(&next) {
            error!(path = %self.path().display(), error = %e, "Failed to write plugin registry");
            return Err(e);
        }
        *guard = next;
        Ok(out)
    }

    fn save(&self, entries: &[PluginRegistryEntry]) -> PluginResult<()> {
        let path = self.path();
        let registry_err = |message: String| PluginError::Registry {
            path: path.clone(),
            message,
        };

        std::fs::create_dir_all(&self.root)
            .map_err(|e| registry_err(format!("failed to create plugins root: {e}")))?;
        let _lock = acquire_lock(&self.root, LockMode::Exclusive)?;

        let body = serde_json::to_vec_pretty(entries)
            .map_err(|e| registry_err(format!("failed to serialize registry: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| registry_err(format!("failed to create temp file: {e}")))?;
        tmp.write_all(&body)
            .map_err(|e| registry_err(format!("failed to write temp registry: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| registry_err(format!("failed to sync temp registry: {e}")))?;
        tmp.persist(&path)
            .map_err(|e| registry_err(format!("failed to replace registry: {e}")))?;

        debug!(path = %path.display(), entries = entries.len(), "Saved plugin registry");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Take the advisory lock on `registry.json.lk`.
///
/// Shared mode creates nothing and returns `None` when no lock file exists.
/// The lock is released when the returned file is dropped.
fn acquire_lock(root: &Path, mode: LockMode) -> PluginResult<Option<File>> {
    let lock_path = plugin_dirs::registry_lock_path(root);
    let lock_err = |message: String| PluginError::Registry {
        path: plugin_dirs::registry_path(root),
        message,
    };

    match mode {
        LockMode::Shared => match std::fs::OpenOptions::new().read(true).open(&lock_path) {
            Ok(file) => {
                file.lock_shared()
                    .map_err(|e| lock_err(format!("failed to acquire shared lock: {e}")))?;
                Ok(Some(file))
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(lock_err(format!("failed to open lock file: {e}"))),
        },
        LockMode::Exclusive => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .read(true)
                .open(&lock_path)
                .map_err(|e| lock_err(format!("failed to open lock file: {e}")))?;
            file.lock_exclusive()
                .map_err(|e| lock_err(format!("failed to acquire exclusive lock: {e}")))?;
            Ok(Some(file))
        },
    }
}

fn remove_dir_logged(id: &str, dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => info!(plugin_id = id, path = %dir.display(), "Removed plugin directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(
            plugin_id = id,
            path = %dir.display(),
            error = %e,
            "Failed to remove plugin directory"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(id: &str, version: &str) -> PluginManifest {
        serde_json::from_value(json!({
            "metadata": { "id": id, "name": "Demo", "version": version, "author": "Tests" },
            "capabilities": {},
            "main": "plugin.wasm"
        }))
        .unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(tmp.path());
        assert_eq!(registry.load().unwrap(), 0);
        assert!(registry.is_empty());
        assert!(!registry.path().exists());
    }

    #[test]
    fn test_register_is_first_only_once() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(tmp.path());
        let dir = tmp.path().join("demo");

        assert!(registry.register_plugin(&manifest("demo", "1.0.0"), &dir).unwrap());
        registry.set_plugin_enabled("demo", true).unwrap();
        let installed_at = registry.get("demo").unwrap().installed_at;

        assert!(!registry.register_plugin(&manifest("demo", "1.1.0"), &dir).unwrap());
        let entry = registry.get("demo").unwrap();
        assert_eq!(entry.version, "1.1.0");
        assert!(entry.enabled);
        assert_eq!(entry.installed_at, installed_at);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(tmp.path());
        registry
            .register_plugin(&manifest("alpha", "1.0.0"), &tmp.path().join("alpha"))
            .unwrap();
        registry
            .register_plugin(&manifest("beta", "2.0.0"), &tmp.path().join("beta"))
            .unwrap();
        registry.set_plugin_enabled("beta", true).unwrap();

        let reopened = PluginRegistry::open(tmp.path()).unwrap();
        assert_eq!(reopened.list(), registry.list());
        assert_eq!(
            reopened.list().iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "beta"]
        );
    }

    #[test]
    fn test_file_is_camel_case_array() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(tmp.path());
        registry
            .register_plugin(&manifest("demo", "1.0.0"), &tmp.path().join("demo"))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(registry.path()).unwrap()).unwrap();
        let first = &raw.as_array().unwrap()[0];
        assert_eq!(first["id"], "demo");
        assert!(first.get("installedAt").is_some());
        assert!(first.get("updatedAt").is_some());
        assert!(plugin_dirs::registry_lock_path(tmp.path()).exists());
    }

    #[test]
    fn test_update_unknown_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(tmp.path());
        let err = registry
            .update_plugin("ghost", PluginRegistryUpdate::default())
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(id) if id == "ghost"));
        assert!(registry.set_plugin_enabled("ghost", true).is_err());
    }

    #[test]
    fn test_remove_deletes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(tmp.path());
        let dir = tmp.path().join("demo");
        std::fs::create_dir_all(dir.join("storage")).unwrap();
        registry.register_plugin(&manifest("demo", "1.0.0"), &dir).unwrap();

        assert!(registry.remove_plugin("demo").unwrap());
        assert!(!dir.exists());
        assert!(!registry.contains("demo"));
        assert!(!registry.remove_plugin("demo").unwrap());
    }

    #[test]
    fn test_remove_deletes_data_dir_of_renamed_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(tmp.path());
        let install = tmp.path().join("demo-1.0");
        std::fs::create_dir_all(&install).unwrap();
        let data = plugin_dirs::storage_dir(tmp.path(), "demo");
        std::fs::create_dir_all(&data).unwrap();
        registry.register_plugin(&manifest("demo", "1.0.0"), &install).unwrap();

        assert!(registry.remove_plugin("demo").unwrap());
        assert!(!install.exists());
        assert!(!plugin_dirs::plugin_dir(tmp.path(), "demo").exists());
    }

    #[test]
    fn test_remove_spares_directory_of_another_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(tmp.path());
        let first = tmp.path().join("elsewhere");
        let second = tmp.path().join("demo");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        registry.register_plugin(&manifest("demo", "1.0.0"), &first).unwrap();
        registry.register_plugin(&manifest("other", "1.0.0"), &second).unwrap();

        assert!(registry.remove_plugin("demo").unwrap());
        assert!(!first.exists());
        assert!(second.exists());
    }

    #[test]
    fn test_unregister_keeps_files() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(tmp.path());
        let dir = tmp.path().join("demo");
        std::fs::create_dir_all(&dir).unwrap();
        registry.register_plugin(&manifest("demo", "1.0.0"), &dir).unwrap();

        assert!(registry.unregister_plugin("demo").unwrap());
        assert!(dir.exists());
    }

    #[test]
    fn test_discover_skips_cache_and_bare_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("plugins");
        let registry = PluginRegistry::new(&root);
        assert!(registry.discover_plugins().unwrap().is_empty());
        assert!(root.is_dir());

        for dir in ["beta", "alpha", CACHE_DIR] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
            std::fs::write(root.join(dir).join(MANIFEST_FILE), "{}").unwrap();
        }
        std::fs::create_dir_all(root.join("no-manifest")).unwrap();
        std::fs::write(root.join(MANIFEST_FILE), "{}").unwrap();

        let found = registry.discover_plugins().unwrap();
        assert_eq!(found, vec![root.join("alpha"), root.join("beta")]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(plugin_dirs::registry_path(tmp.path()), "{not json").unwrap();
        let err = PluginRegistry::new(tmp.path()).load().unwrap_err();
        assert!(matches!(err, PluginError::Registry { .. }));
    }
}
