//! Environment variable overrides applied on top of file configuration.

use tracing::debug;

/// Overrides `plugins.root`.
pub const ENV_PLUGINS_DIR: &str = "SWITCHYARD_PLUGINS_DIR";
/// Overrides `logging.level`.
pub const ENV_LOG_LEVEL: &str = "SWITCHYARD_LOG_LEVEL";
/// Overrides `logging.format`.
pub const ENV_LOG_FORMAT: &str = "SWITCHYARD_LOG_FORMAT";
/// Points at the user config file.
pub const ENV_CONFIG_PATH: &str = "SWITCHYARD_CONFIG";

/// Variable name to dotted config path.
const OVERRIDES: &[(&str, &[&str])] = &[
    (ENV_PLUGINS_DIR, &["plugins", "root"]),
    (ENV_LOG_LEVEL, &["logging", "level"]),
    (ENV_LOG_FORMAT, &["logging", "format"]),
];

/// Apply every set, non-empty override variable to `merged`.
///
/// `lookup` resolves a variable name; production callers pass
/// `std::env::var`. Returns the number of overrides applied.
pub fn apply_env_overrides(
    merged: &mut toml::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> usize {
    let mut applied: usize = 0;
    for (name, path) in OVERRIDES {
        let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        if set_path(merged, path, toml::Value::String(value)) {
            debug!(var = name, field = path.join("."), "applied environment override");
            applied = applied.saturating_add(1);
        }
    }
    applied
}

/// Set a nested key, creating intermediate tables. Returns false if a
/// non-table value sits in the way.
fn set_path(root: &mut toml::Value, path: &[&str], value: toml::Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = root;
    for key in parents {
        let Some(table) = current.as_table_mut() else {
            return false;
        };
        current = table
            .entry((*key).to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    match current.as_table_mut() {
        Some(table) => {
            table.insert((*last).to_owned(), value);
            true
        },
        None => false,
    }
}
