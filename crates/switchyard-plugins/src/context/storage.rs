//! Per-plugin key/value storage.
//!
//! Each key is one JSON file at `<root>/<id>/storage/<key>.json`. A missing
//! file reads as `None`.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::plugin_dirs;

const KEY_SUFFIX: &str = ".json";
const MAX_KEY_LEN: usize = 128;

/// Plugin-scoped persistent storage.
#[derive(Debug, Clone)]
pub struct PluginStorage {
    dir: PathBuf,
}

impl PluginStorage {
    /// Storage for `plugin_id` under the plugins `root`.
    #[must_use]
    pub fn new(root: &Path, plugin_id: &str) -> Self {
        Self {
            dir: plugin_dirs::storage_dir(root, plugin_id),
        }
    }

    /// The storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> PluginResult<PathBuf> {
        check_key(key)?;
        Ok(self.dir.join(format!("{key}{KEY_SUFFIX}")))
    }

    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the file exists but cannot
    /// be read or parsed.
    pub async fn get(&self, key: &str) -> PluginResult<Option<Value>> {
        let path = self.key_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PluginError::Storage(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Write a value, creating the storage directory on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the file cannot be written.
    pub async fn set(&self, key: &str, value: &Value) -> PluginResult<()> {
        let path = self.key_path(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            PluginError::Storage(format!("failed to write {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Stored plugin value");
        Ok(())
    }

    /// Delete a value. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the file cannot be removed.
    pub async fn delete(&self, key: &str) -> PluginResult<bool> {
        let path = self.key_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All stored keys, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory cannot be listed.
    pub async fn keys(&self) -> PluginResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(KEY_SUFFIX))
            {
                keys.push(key.to_owned());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Remove every stored value.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory cannot be removed.
    pub async fn clear(&self) -> PluginResult<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keys map to file names, so they may not name a path.
fn check_key(key: &str) -> PluginResult<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PluginError::Storage(format!("invalid storage key: '{key}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = PluginStorage::new(tmp.path(), "word-count");

        assert_eq!(storage.get("totals").await.unwrap(), None);
        storage.set("totals", &json!({"words": 12})).await.unwrap();
        assert_eq!(
            storage.get("totals").await.unwrap(),
            Some(json!({"words": 12}))
        );
        assert!(
            tmp.path()
                .join("word-count/storage/totals.json")
                .is_file()
        );
    }

    #[tokio::test]
    async fn test_keys_delete_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = PluginStorage::new(tmp.path(), "word-count");
        assert!(storage.keys().await.unwrap().is_empty());

        storage.set("b", &json!(2)).await.unwrap();
        storage.set("a", &json!(1)).await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["a", "b"]);

        assert!(storage.delete("a").await.unwrap());
        assert!(!storage.delete("a").await.unwrap());

        storage.clear().await.unwrap();
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_path_like_keys_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = PluginStorage::new(tmp.path(), "word-count");
        for key in ["", "../escape", "a/b", ".hidden", "a\\b"] {
            assert!(
                matches!(storage.get(key).await, Err(PluginError::Storage(_))),
                "{key}"
            );
        }
    }
}
