//! Switchyard Config - layered TOML configuration for the shell.
//!
//! Values come from the embedded defaults, the user file
//! (`~/.switchyard/config.toml`), an optional explicit file and finally
//! `SWITCHYARD_*` environment variables for anything no file set.
//!
//! # Example
//!
//! ```rust,no_run
//! use switchyard_config::Config;
//!
//! # fn main() -> Result<(), switchyard_config::ConfigError> {
//! let resolved = Config::load(None)?;
//! println!("multiprocess: {}", resolved.config.shell.enable_multiprocess);
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

mod env;
mod error;
mod loader;
mod merge;
mod types;
mod validate;

use std::path::Path;

pub use env::HOME_ENV_VAR;
pub use error::{ConfigError, ConfigResult};
pub use loader::{MAX_CONFIG_FILE_SIZE, ResolvedConfig, load, load_file, load_with_env};
pub use merge::FieldSources;
pub use types::{Config, LoggingSection, ShellSection, SystemSection};

impl Config {
    /// Load the layered configuration, optionally on top of an explicit file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any layer is malformed or the result
    /// fails validation.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<ResolvedConfig> {
        loader::load(explicit, None)
    }

    /// Re-run validation, e.g. after command-line overrides were applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad field.
    pub fn validate(&self) -> ConfigResult<()> {
        validate::validate(self)
    }
}
