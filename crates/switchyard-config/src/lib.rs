#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Configuration for the Switchyard plugin subsystem.
//!
//! A single [`Config`] covers where plugins live, which of them are trusted
//! to run outside the sandbox, the sandbox quotas, the host permission policy
//! that bounds what any manifest may request, hook dispatch timing, and
//! logging.
//!
//! # Usage
//!
//! ```rust,no_run
//! use switchyard_config::Config;
//!
//! let config = Config::load(None).unwrap();
//! println!("plugins root: {}", config.plugins_root().display());
//! ```
//!
//! # Precedence
//!
//! From highest to lowest priority:
//!
//! 1. Environment variables (`SWITCHYARD_PLUGINS_DIR`, `SWITCHYARD_LOG_LEVEL`,
//!    `SWITCHYARD_LOG_FORMAT`)
//! 2. The user file (`$SWITCHYARD_CONFIG`, or `config.toml` in the platform
//!    config directory)
//! 3. Embedded defaults (`defaults.toml` compiled into the binary)

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::*;

impl Config {
    /// Load configuration: defaults, then the user file, then environment.
    ///
    /// `path` overrides user file discovery.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a file is malformed or the merged
    /// configuration fails validation.
    pub fn load(path: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(path, &|key: &str| std::env::var(key).ok())
    }

    /// Load a single file on top of the embedded defaults, ignoring the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or
    /// validated.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }

    /// Parse a TOML document on top of the embedded defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the document cannot be parsed or fails
    /// validation.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        loader::from_toml_str(content)
    }
}
