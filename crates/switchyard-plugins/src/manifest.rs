//! Plugin manifest types.
//!
//! A manifest lives at `<plugin_dir>/plugin.json`:
//!
//! ```json
//! {
//!   "metadata": {
//!     "id": "word-count",
//!     "name": "Word Count",
//!     "version": "1.0.0",
//!     "author": "Switchyard",
//!     "description": "Counts words in task prompts",
//!     "license": "MIT"
//!   },
//!   "capabilities": { "taskTypes": ["summarize"] },
//!   "main": "plugin.wasm",
//!   "permissions": {
//!     "filesystem": { "read": ["./data"], "write": ["./templates"] },
//!     "network": { "hosts": ["api.example.com"] }
//!   },
//!   "configuration": {
//!     "properties": {
//!       "threshold": { "type": "number", "description": "Word limit", "default": 500 }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PluginError, PluginResult};

/// Manifest file name inside each plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Prefix of `main` values that name a native first-party plugin.
pub const BUILTIN_PREFIX: &str = "builtin:";

/// A plugin's declarative descriptor. Authoritative for identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Identity.
    pub metadata: PluginMetadata,
    /// Declared capabilities.
    pub capabilities: PluginCapabilities,
    /// Entry point, relative to the plugin directory.
    pub main: String,
    /// Requested permissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PluginPermissions>,
    /// Configuration schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<PluginConfigurationSchema>,
}

impl PluginManifest {
    /// Requested permissions, or the empty set.
    #[must_use]
    pub fn permissions_or_default(&self) -> PluginPermissions {
        self.permissions.clone().unwrap_or_default()
    }

    /// The builtin name if `main` is `builtin:<name>`.
    #[must_use]
    pub fn builtin_name(&self) -> Option<&str> {
        self.main.strip_prefix(BUILTIN_PREFIX)
    }
}

/// Plugin identity.
///
/// Required string fields default to empty so that a manifest missing one
/// still parses and validation can name exactly the missing field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    /// Unique id, `^[a-z0-9-]+$`.
    #[serde(default)]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Semantic version.
    #[serde(default)]
    pub version: String,
    /// Author.
    #[serde(default)]
    pub author: String,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// SPDX license.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Search keywords.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Project homepage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

/// What a plugin says it supports. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginCapabilities {
    /// Task types the plugin understands.
    #[serde(default)]
    pub task_types: Vec<String>,
    /// Adapters the plugin works with.
    #[serde(default)]
    pub adapters: Vec<String>,
    /// Custom task types the plugin introduces.
    #[serde(default)]
    pub custom_types: Vec<String>,
    /// Free-form feature flags.
    #[serde(default)]
    pub features: Vec<String>,
}

/// Requested permissions. An allow-list, never a grant by itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginPermissions {
    /// Filesystem paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemPermissions>,
    /// Network hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPermissions>,
    /// System access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPermissions>,
}

impl PluginPermissions {
    /// Paths the plugin may read.
    #[must_use]
    pub fn read_paths(&self) -> &[String] {
        self.filesystem.as_ref().map_or(&[], |fs| fs.read.as_slice())
    }

    /// Paths the plugin may write.
    #[must_use]
    pub fn write_paths(&self) -> &[String] {
        self.filesystem.as_ref().map_or(&[], |fs| fs.write.as_slice())
    }

    /// Network host patterns.
    #[must_use]
    pub fn hosts(&self) -> &[String] {
        self.network.as_ref().map_or(&[], |n| n.hosts.as_slice())
    }

    /// Environment variable names the plugin may read.
    #[must_use]
    pub fn env_vars(&self) -> &[String] {
        self.system.as_ref().map_or(&[], |s| s.env.as_slice())
    }

    /// Whether any filesystem path was requested.
    #[must_use]
    pub fn wants_filesystem(&self) -> bool {
        !self.read_paths().is_empty() || !self.write_paths().is_empty()
    }

    /// Whether any network host was requested.
    #[must_use]
    pub fn wants_network(&self) -> bool {
        !self.hosts().is_empty()
    }

    /// Whether any environment variable was requested.
    #[must_use]
    pub fn wants_env(&self) -> bool {
        !self.env_vars().is_empty()
    }

    /// Whether process execution was requested.
    #[must_use]
    pub fn wants_exec(&self) -> bool {
        self.system.as_ref().and_then(|s| s.exec).unwrap_or(false)
    }
}

/// Filesystem allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPermissions {
    /// Readable paths.
    #[serde(default)]
    pub read: Vec<String>,
    /// Writable paths.
    #[serde(default)]
    pub write: Vec<String>,
}

/// Network allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPermissions {
    /// Host patterns: `*`, `*.domain`, domain, IPv4, or loopback.
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// System allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPermissions {
    /// Readable environment variable names.
    #[serde(default)]
    pub env: Vec<String>,
    /// Process execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<bool>,
}

/// Configuration schema backing the per-plugin key-value config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfigurationSchema {
    /// Property name to definition.
    #[serde(default)]
    pub properties: BTreeMap<String, ConfigProperty>,
}

impl PluginConfigurationSchema {
    /// Defaults declared by the schema.
    pub fn defaults(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.properties
            .iter()
            .filter_map(|(name, prop)| prop.default.as_ref().map(|d| (name.as_str(), d)))
    }
}

/// One configuration property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigProperty {
    /// Declared type: `string`, `number`, `boolean`, `array`, or `object`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    /// Lower bound for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Upper bound for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

impl ConfigProperty {
    /// The declared type, if recognized.
    #[must_use]
    pub fn property_type(&self) -> Option<PropertyType> {
        PropertyType::parse(&self.kind)
    }

    /// Check a value against type, enum, and bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let Some(kind) = self.property_type() else {
            return Err(format!("unrecognized type '{}'", self.kind));
        };
        if !kind.matches(value) {
            return Err(format!("expected {}, got {value}", self.kind));
        }
        if let Some(allowed) = &self.allowed
            && !allowed.contains(value)
        {
            return Err(format!("{value} is not one of the allowed values"));
        }
        if let Some(n) = value.as_f64() {
            if self.minimum.is_some_and(|min| n < min) {
                return Err(format!("{n} is below the minimum"));
            }
            if self.maximum.is_some_and(|max| n > max) {
                return Err(format!("{n} is above the maximum"));
            }
        }
        Ok(())
    }
}

/// Recognized configuration property types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// JSON string.
    String,
    /// JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl PropertyType {
    /// Parse a schema type name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    /// Whether a JSON value has this type.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Path of the manifest inside a plugin directory.
#[must_use]
pub fn manifest_path(plugin_dir: &Path) -> PathBuf {
    plugin_dir.join(MANIFEST_FILE)
}

/// Read a plugin directory's manifest as raw JSON.
///
/// # Errors
///
/// Returns [`PluginError::ManifestParseError`] if the file is missing or is
/// not JSON.
pub fn read_manifest_value(plugin_dir: &Path) -> PluginResult<Value> {
    let path = manifest_path(plugin_dir);
    let content = std::fs::read_to_string(&path).map_err(|e| PluginError::ManifestParseError {
        path: path.clone(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| PluginError::ManifestParseError {
        path,
        message: e.to_string(),
    })
}

/// Read and parse a plugin directory's manifest.
///
/// Parsing is structural only; run the validator for semantic checks.
///
/// # Errors
///
/// Returns [`PluginError::ManifestParseError`] on read or parse failure.
pub fn load_manifest(plugin_dir: &Path) -> PluginResult<PluginManifest> {
    let value = read_manifest_value(plugin_dir)?;
    serde_json::from_value(value).map_err(|e| PluginError::ManifestParseError {
        path: manifest_path(plugin_dir),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "metadata": {
                "id": "word-count",
                "name": "Word Count",
                "version": "1.0.0",
                "author": "Switchyard",
                "keywords": ["text"]
            },
            "capabilities": { "taskTypes": ["summarize"], "customTypes": ["count"] },
            "main": "plugin.wasm",
            "permissions": {
                "filesystem": { "write": ["./templates"] },
                "system": { "env": ["HOME"], "exec": false }
            },
            "configuration": {
                "properties": {
                    "limit": { "type": "number", "default": 10, "minimum": 1, "maximum": 100 }
                }
            }
        })
    }

    #[test]
    fn test_parse_camel_case_manifest() {
        let manifest: PluginManifest = serde_json::from_value(sample()).unwrap();
        assert_eq!(manifest.metadata.id, "word-count");
        assert_eq!(manifest.capabilities.task_types, vec!["summarize"]);
        assert_eq!(manifest.capabilities.custom_types, vec!["count"]);
        let perms = manifest.permissions_or_default();
        assert_eq!(perms.write_paths(), ["./templates".to_string()]);
        assert!(perms.read_paths().is_empty());
        assert!(perms.wants_filesystem());
        assert!(perms.wants_env());
        assert!(!perms.wants_exec());
        assert!(!perms.wants_network());
    }

    #[test]
    fn test_missing_metadata_fields_default_empty() {
        let manifest: PluginManifest = serde_json::from_value(json!({
            "metadata": { "id": "x" },
            "capabilities": {},
            "main": "x.wasm"
        }))
        .unwrap();
        assert!(manifest.metadata.name.is_empty());
        assert!(manifest.permissions.is_none());
    }

    #[test]
    fn test_builtin_name() {
        let mut manifest: PluginManifest = serde_json::from_value(sample()).unwrap();
        assert_eq!(manifest.builtin_name(), None);
        manifest.main = "builtin:word-count".into();
        assert_eq!(manifest.builtin_name(), Some("word-count"));
    }

    #[test]
    fn test_property_check() {
        let manifest: PluginManifest = serde_json::from_value(sample()).unwrap();
        let schema = manifest.configuration.unwrap();
        let limit = &schema.properties["limit"];
        assert!(limit.check(&json!(50)).is_ok());
        assert!(limit.check(&json!("50")).is_err());
        assert!(limit.check(&json!(0)).is_err());
        assert!(limit.check(&json!(101)).is_err());
        assert_eq!(schema.defaults().count(), 1);
    }

    #[test]
    fn test_property_enum() {
        let prop = ConfigProperty {
            kind: "string".into(),
            allowed: Some(vec![json!("fast"), json!("slow")]),
            ..ConfigProperty::default()
        };
        assert!(prop.check(&json!("fast")).is_ok());
        assert!(prop.check(&json!("medium")).is_err());
    }

    #[test]
    fn test_load_manifest_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), sample().to_string()).unwrap();
        let manifest = load_manifest(dir.path()).unwrap();
        assert_eq!(manifest.main, "plugin.wasm");
    }

    #[test]
    fn test_load_manifest_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_manifest(dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::ManifestParseError { .. }));
    }
}
