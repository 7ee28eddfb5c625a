//! Per-plugin persisted configuration.
//!
//! Values live at `<root>/<id>/config.json` as a single JSON object. The
//! store is seeded with schema defaults at creation and rewritten on every
//! [`PluginConfig::set`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginConfigurationSchema;
use crate::plugin_dirs;

/// Plugin-scoped configuration values. Clones share the same store.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    path: PathBuf,
    schema: Option<Arc<PluginConfigurationSchema>>,
    values: Arc<Mutex<Map<String, Value>>>,
}

impl PluginConfig {
    /// Open the configuration for `plugin_id`, seeding missing keys from
    /// the schema's defaults.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if the file exists but is not a JSON
    /// object.
    pub fn open(
        root: &Path,
        plugin_id: &str,
        schema: Option<&PluginConfigurationSchema>,
    ) -> PluginResult<Self> {
        let path = plugin_dirs::config_path(root, plugin_id);
        let mut values = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(PluginError::Config(format!(
                        "{} must contain a JSON object",
                        path.display()
                    )));
                },
                Err(e) => {
                    return Err(PluginError::Config(format!(
                        "failed to parse {}: {e}",
                        path.display()
                    )));
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };

        if let Some(schema) = schema {
            for (key, default) in schema.defaults() {
                values
                    .entry(key.to_owned())
                    .or_insert_with(|| default.clone());
            }
        }

        Ok(Self {
            path,
            schema: schema.cloned().map(Arc::new),
            values: Arc::new(Mutex::new(values)),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    /// Snapshot of every value.
    #[must_use]
    pub fn get_all(&self) -> Map<String, Value> {
        self.values
            .lock()
            .map(|values| values.clone())
            .unwrap_or_default()
    }

    /// Set one value and persist the whole object.
    ///
    /// Keys declared in the schema are checked against their property
    /// definition. The in-memory value only changes if the write succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if the value violates the schema or
    /// the file cannot be written.
    pub fn set(&self, key: &str, value: Value) -> PluginResult<()> {
        if let Some(property) = self
            .schema
            .as_deref()
            .and_then(|schema| schema.properties.get(key))
        {
            property
                .check(&value)
                .map_err(|reason| PluginError::Config(format!("{key}: {reason}")))?;
        }

        let mut values = self
            .values
            .lock()
            .map_err(|e| PluginError::Config(format!("config lock poisoned: {e}")))?;
        let mut next = values.clone();
        next.insert(key.to_owned(), value);
        write_atomic(&self.path, &next)?;
        *values = next;
        debug!(path = %self.path.display(), key, "Saved plugin config");
        Ok(())
    }
}

/// Write to a temp file beside `path`, then rename over it.
fn write_atomic(path: &Path, values: &Map<String, Value>) -> PluginResult<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    let body = serde_json::to_vec_pretty(values)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        PluginError::Config(format!("failed to create temp file in {}: {e}", parent.display()))
    })?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        PluginError::Config(format!("failed to replace {}: {e}", path.display()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> PluginConfigurationSchema {
        serde_json::from_value(json!({
            "properties": {
                "threshold": { "type": "number", "description": "Limit", "default": 500 },
                "mode": { "type": "string", "description": "Mode", "enum": ["fast", "slow"] }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_seeded_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PluginConfig::open(tmp.path(), "word-count", Some(&schema())).unwrap();
        assert_eq!(config.get("threshold"), Some(json!(500)));
        assert_eq!(config.get("mode"), None);
        assert!(!config.path().exists());
    }

    #[test]
    fn test_set_persists_and_reopens() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PluginConfig::open(tmp.path(), "word-count", Some(&schema())).unwrap();
        config.set("threshold", json!(42)).unwrap();
        config.set("extra", json!(true)).unwrap();

        let reopened = PluginConfig::open(tmp.path(), "word-count", Some(&schema())).unwrap();
        assert_eq!(reopened.get("threshold"), Some(json!(42)));
        assert_eq!(reopened.get("extra"), Some(json!(true)));
        assert_eq!(reopened.get_all().len(), 2);
    }

    #[test]
    fn test_set_rejects_schema_violations() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PluginConfig::open(tmp.path(), "word-count", Some(&schema())).unwrap();
        assert!(matches!(
            config.set("threshold", json!("many")),
            Err(PluginError::Config(_))
        ));
        assert!(config.set("mode", json!("medium")).is_err());
        assert!(config.set("mode", json!("fast")).is_ok());
        assert_eq!(config.get("threshold"), Some(json!(500)));
    }

    #[test]
    fn test_non_object_file_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = plugin_dirs::config_path(tmp.path(), "word-count");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(PluginConfig::open(tmp.path(), "word-count", None).is_err());
    }
}
