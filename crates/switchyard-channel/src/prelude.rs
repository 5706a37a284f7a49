//! Prelude module - commonly used types for convenient import.
//!
//! Use `use switchyard_channel::prelude::*;` to import all essential types.

// Errors
pub use crate::{ChannelError, ChannelResult};

// Channels
pub use crate::{ChannelId, ChannelManager, ChannelOptions, ChannelState};

// Threads and transport
pub use crate::{IoThread, IoThreadHandle, PlatformChannelPair};

// Bootstrap
pub use crate::{ChannelObserver, ConnectionId};
