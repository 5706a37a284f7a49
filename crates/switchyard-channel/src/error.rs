//! Channel error types.

use switchyard_system::SystemError;
use thiserror::Error;

use crate::id::ChannelId;

/// Errors that can occur on a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Transport I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote side hung up.
    #[error("Connection closed by peer")]
    PeerClosed,

    /// Malformed or unexpected frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame exceeded the size limit.
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The bootstrap handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// No channel with this id exists.
    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// The IO thread is not running.
    #[error("IO thread stopped")]
    IoThreadStopped,

    /// Handle table or dispatcher failure.
    #[error(transparent)]
    System(#[from] SystemError),
}

impl ChannelError {
    /// Whether this is an orderly hang-up rather than a fault.
    #[must_use]
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}

impl From<nix::Error> for ChannelError {
    fn from(errno: nix::Error) -> Self {
        Self::Io(std::io::Error::from(errno))
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
