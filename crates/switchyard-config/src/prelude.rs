//! Prelude module - commonly used types for convenient import.
//!
//! Use `use switchyard_config::prelude::*;` to import all essential types.

pub use crate::{Config, ConfigError, ConfigResult, ResolvedConfig};
pub use crate::{LoggingSection, ShellSection, SystemSection};
