//! Switchyard Channel - many message pipes over one OS socket.
//!
//! This crate provides:
//! - A length-prefixed frame codec with `SCM_RIGHTS` descriptor passing
//! - [`IoThread`]: the thread that owns every socket and its I/O futures
//! - [`ChannelManager`]: channel creation, two-phase drain/destroy, error delivery
//! - The bootstrap handshake proving a child's [`ConnectionId`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use switchyard_channel::{ChannelManager, ChannelOptions, IoThread, PlatformChannelPair};
//! use switchyard_system::{Core, SystemLimits};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let io = IoThread::spawn("switchyard-io")?;
//! let core = Arc::new(Core::new(SystemLimits::default())?);
//! let channels = ChannelManager::new(Arc::clone(&core), io.handle());
//!
//! let (local, _remote) = PlatformChannelPair::new()?.into_parts();
//! let (id, pipe) = channels.create_channel(local, ChannelOptions::new())?;
//! core.write_message(pipe, b"hello".to_vec(), &[])?;
//!
//! channels.will_destroy_channel(id)?;
//! channels.post_destroy_channel(id)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod frame;
pub mod prelude;

mod bootstrap;
mod channel;
mod error;
mod id;
mod io_thread;
mod manager;
mod platform;

pub use bootstrap::{
    CHILD_CONNECTION_ID_SWITCH, ChannelDelegate, ChannelObserver, ChannelOptions, ConnectionId,
    Handshake,
};
pub use channel::ChannelState;
pub use error::{ChannelError, ChannelResult};
pub use id::ChannelId;
pub use io_thread::{IoThread, IoThreadHandle};
pub use manager::ChannelManager;
pub use platform::{PLATFORM_CHANNEL_FD_SWITCH, PlatformChannelPair, take_inherited_fd};
