//! Switchyard Shell - the application shell on top of the IPC core.
//!
//! This crate provides:
//! - [`UrlResolver`]: URL mappings and `app:` resolution against an origin
//! - [`ApplicationManager`]: routes connection requests to running
//!   applications or to the loader that can start them
//! - [`NativeApplicationLoader`]: runs `file:` code units in-process on a
//!   worker thread or out-of-process in a bootstrapped child
//! - [`ChildProcessHost`] and [`run_child`]: both ends of the child
//!   bootstrap and control protocol
//! - [`ShellContext`]: the threads, core and event loop of a shell process
//!
//! # Example
//!
//! ```rust,no_run
//! use switchyard_config::Config;
//! use switchyard_shell::{AppUrl, ShellContext};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?.config;
//! let mut shell = ShellContext::from_config(&config)?;
//! shell.run(&AppUrl::parse("app:hello_world")?);
//! shell.run_event_loop();
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
pub mod protocol;
pub mod runner;

mod app_url;
mod child;
mod child_host;
mod code_unit;
mod completion;
mod context;
mod control;
mod error;
mod events;
mod loader;
mod manager;
mod native_library;
mod native_loader;
mod resolver;

pub use app_url::AppUrl;
pub use child::{ChildOptions, FATAL_EXIT_CODE, run_child};
pub use child_host::{
    ChildProcessHost, ChildProcessOptions, ChildState, CompletionReason, NO_PROCESS_EXIT_CODE,
    limit_switches,
};
pub use code_unit::{CleanupPolicy, CodeUnit, CodeUnitLoader};
pub use completion::AppCompletion;
pub use context::{CHILD_BINARY_NAME, ShellContext, default_child_path, limits_from_config};
pub use control::ControlMessage;
pub use error::{ShellError, ShellResult};
pub use events::{ShellEvent, ShellEventQueue, ShellEventSender};
pub use loader::ApplicationLoader;
pub use manager::{AppId, ApplicationManager, SHELL_URL};
pub use native_library::{
    INDEFINITE_DEADLINE, MAIN_SYMBOL, NativeLibrary, NativeLibraryLoader, SET_THUNKS_SYMBOL,
    SystemThunks,
};
pub use native_loader::NativeApplicationLoader;
pub use resolver::{APP_EXTENSION, APP_SCHEME, UrlResolver};
