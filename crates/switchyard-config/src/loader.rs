//! Config file discovery and layered loading.
//!
//! 1. Parse `defaults.toml` into the base tree
//! 2. Merge the user file (explicit path, `$SWITCHYARD_CONFIG`, or the
//!    platform config directory)
//! 3. Apply environment overrides
//! 4. Deserialize and validate

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{ENV_CONFIG_PATH, apply_env_overrides};
use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MiB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Load the layered configuration.
///
/// `path` takes precedence over `$SWITCHYARD_CONFIG` and the platform
/// default location. A missing user file is not an error.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a file is malformed or the merged
/// configuration fails validation.
pub fn load(path: Option<&Path>, lookup: &dyn Fn(&str) -> Option<String>) -> ConfigResult<Config> {
    let mut merged = defaults()?;

    let user_path = path
        .map(Path::to_path_buf)
        .or_else(|| lookup(ENV_CONFIG_PATH).map(PathBuf::from))
        .or_else(default_user_path);

    if let Some(user_path) = user_path
        && let Some(overlay) = try_load_file(&user_path)?
    {
        deep_merge(&mut merged, &overlay);
        info!(path = %user_path.display(), "loaded user config");
    }

    let applied = apply_env_overrides(&mut merged, lookup);
    if applied > 0 {
        debug!(count = applied, "applied environment overrides");
    }

    finish(merged, "<merged config>")
}

/// Load one file on top of the embedded defaults.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file is missing, oversized, malformed,
/// or fails validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let Some(overlay) = try_load_file(path)? else {
        return Err(ConfigError::ReadError {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    };
    let mut merged = defaults()?;
    deep_merge(&mut merged, &overlay);
    finish(merged, &path.display().to_string())
}

/// Parse a TOML document on top of the embedded defaults.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the document is malformed or fails
/// validation.
pub fn from_toml_str(content: &str) -> ConfigResult<Config> {
    let overlay: toml::Value = toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: "<string>".to_owned(),
        source: e,
    })?;
    let mut merged = defaults()?;
    deep_merge(&mut merged, &overlay);
    finish(merged, "<string>")
}

fn defaults() -> ConfigResult<toml::Value> {
    toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
        path: "<embedded defaults>".to_owned(),
        source: e,
    })
}

fn finish(merged: toml::Value, label: &str) -> ConfigResult<Config> {
    let config: Config = merged
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: label.to_owned(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

fn default_user_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "switchyard", "switchyard")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Recursively deep-merge `overlay` into `base`.
///
/// Tables merge per key. Scalars and arrays from the overlay replace the
/// base value.
pub fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// Try to load a file, returning `None` if it doesn't exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}
