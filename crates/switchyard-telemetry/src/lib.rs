//! Switchyard Telemetry - `tracing` subscriber setup shared by the shell and
//! its child processes.
//!
//! # Example
//!
//! ```rust,no_run
//! use switchyard_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), switchyard_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Pretty)
//!     .with_directive("switchyard_channel=debug");
//! setup_logging(&config)?;
//! tracing::info!("shell starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
