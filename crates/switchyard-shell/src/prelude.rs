//! Prelude module - commonly used types for convenient import.
//!
//! Use `use switchyard_shell::prelude::*;` to import all essential types.

// Errors
pub use crate::{ShellError, ShellResult};

// Shell
pub use crate::{AppUrl, ApplicationLoader, ApplicationManager, ShellContext, UrlResolver};

// Native applications
pub use crate::{AppCompletion, CleanupPolicy, CodeUnit, CodeUnitLoader};

// Wire protocol
pub use crate::protocol::{ApplicationMessage, ServiceMessage, ServicePipes, ShellMessage};
