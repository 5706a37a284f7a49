//! Switchyard System - handles, dispatchers and readiness waits.
//!
//! This crate provides:
//! - A generation-checked [`HandleTable`] mapping handles to dispatchers
//! - Message pipe endpoints, shared buffers and wrapped platform handles
//! - One-shot asynchronous waits that never fire inside registration
//! - Named [`TaskRunner`] threads for ordered task posting
//!
//! # Example
//!
//! ```rust
//! use switchyard_system::{Core, Signals, SystemLimits};
//!
//! # fn main() -> Result<(), switchyard_system::SystemError> {
//! let core = Core::new(SystemLimits::default())?;
//! let (a, b) = core.create_message_pipe()?;
//!
//! core.write_message(a, b"hello".to_vec(), &[])?;
//! core.wait(b, Signals::READABLE, None)?;
//! assert_eq!(core.read_message(b)?.bytes, b"hello");
//!
//! core.close(a)?;
//! core.close(b)?;
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

mod core;
mod dispatcher;
mod error;
mod handle;
mod signals;
mod sync;
mod table;
mod task_runner;
mod waiter;

pub use crate::core::{Core, ReadMessage, SystemLimits, WaitManyOutcome};
pub use dispatcher::{
    Dispatcher, DispatcherKind, Message, MessagePipeEndpoint, PlatformHandleDispatcher,
    RemotePeer, SharedBufferDispatcher, WeakMessagePipeEndpoint,
};
pub use error::{ResultCode, SystemError, SystemResult};
pub use handle::Handle;
pub use signals::{Signals, SignalsState};
pub use table::{DEFAULT_MAX_HANDLES, HandleTable};
pub use task_runner::{TaskRunner, TaskRunnerHandle};
pub use waiter::{WaitCallback, WaiterId};
