//! Switchyard Telemetry - Logging for the Switchyard task router.
//!
//! Wraps `tracing-subscriber` so the host sets up logging once from its
//! configuration, in one of four formats, to stdout, stderr, or a rolling
//! file.
//!
//! # Example
//!
//! ```rust,no_run
//! use switchyard_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), switchyard_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("switchyard_plugins=trace");
//!
//! let _guard = setup_logging(&config)?;
//! tracing::info!("logging ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    LogConfig, LogFormat, LogGuard, LogTarget, setup_default_logging, setup_logging,
};
