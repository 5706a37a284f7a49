//! Bootstrap handshake and per-channel options.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{ChannelError, ChannelResult};
use crate::id::ChannelId;

/// Command-line switch carrying the child's connection id.
pub const CHILD_CONNECTION_ID_SWITCH: &str = "child-connection-id";

/// Unguessable per-launch token proving that a bootstrapped child is the one
/// the host spawned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// A fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// The token as sent on the wire and on the command line.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `--child-connection-id=<id>` argument for a child command line.
    #[must_use]
    pub fn to_switch(&self) -> String {
        format!("--{CHILD_CONNECTION_ID_SWITCH}={}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = ChannelError;

    fn from_str(s: &str) -> ChannelResult<Self> {
        if s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(ChannelError::Handshake(format!("malformed connection id {s:?}")))
        }
    }
}

/// What a channel does with the bootstrap `Hello` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Handshake {
    /// No handshake; traffic flows immediately.
    #[default]
    None,
    /// Host side: reject everything until `Hello` with this id arrives.
    Expect(ConnectionId),
    /// Child side: send `Hello` with this id as the very first frame.
    Announce(ConnectionId),
}

/// Per-channel notifications.
///
/// Called on the IO thread. Implementations must not block.
pub trait ChannelObserver: Send + Sync {
    /// The transport is attached and, if required, the handshake completed.
    fn on_connected(&self, _id: ChannelId) {}

    /// The channel failed. Every proxied endpoint has been marked peer-closed.
    fn on_error(&self, id: ChannelId, error: &ChannelError);
}

/// Manager-wide error sink, usually the application layer.
pub trait ChannelDelegate: Send + Sync {
    /// A channel failed.
    fn on_channel_error(&self, id: ChannelId, error: &ChannelError);
}

/// Options for [`crate::ChannelManager::create_channel`].
#[derive(Clone, Default)]
pub struct ChannelOptions {
    pub(crate) handshake: Handshake,
    pub(crate) observer: Option<Arc<dyn ChannelObserver>>,
}

impl ChannelOptions {
    /// Options for a plain channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the peer to announce `id` before anything else.
    #[must_use]
    pub fn expect_connection_id(mut self, id: ConnectionId) -> Self {
        self.handshake = Handshake::Expect(id);
        self
    }

    /// Announce `id` as the first frame.
    #[must_use]
    pub fn announce_connection_id(mut self, id: ConnectionId) -> Self {
        self.handshake = Handshake::Announce(id);
        self
    }

    /// Receive connection and error notifications.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ChannelObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The configured handshake.
    #[must_use]
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("handshake", &self.handshake)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_hex_and_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(a.as_str().parse::<ConnectionId>().unwrap(), a);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<ConnectionId>().is_err());
        assert!("xyz".parse::<ConnectionId>().is_err());
        assert!("g".repeat(32).parse::<ConnectionId>().is_err());
        assert!("A".repeat(32).parse::<ConnectionId>().is_ok());
    }

    #[test]
    fn test_switch_format() {
        let id = ConnectionId::generate();
        assert_eq!(id.to_switch(), format!("--child-connection-id={id}"));
    }

    #[test]
    fn test_options_builders() {
        let id = ConnectionId::generate();
        let opts = ChannelOptions::new().expect_connection_id(id.clone());
        assert_eq!(opts.handshake(), &Handshake::Expect(id));
        assert_eq!(ChannelOptions::default().handshake(), &Handshake::None);
    }
}
