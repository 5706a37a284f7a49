//! Prelude module - commonly used types for convenient import.
//!
//! Use `use switchyard_system::prelude::*;` to import all essential types.

// Errors
pub use crate::{ResultCode, SystemError, SystemResult};

// Handles and readiness
pub use crate::{Handle, Signals, SignalsState};

// Core API
pub use crate::{Core, ReadMessage, SystemLimits};

// Dispatchers
pub use crate::{Dispatcher, DispatcherKind, Message, MessagePipeEndpoint};

// Threads
pub use crate::{TaskRunner, TaskRunnerHandle};
