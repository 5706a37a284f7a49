//! Dispatchers: the resources a handle can refer to.

mod message_pipe;
mod platform_handle;
mod shared_buffer;

pub use message_pipe::{Message, MessagePipeEndpoint, RemotePeer, WeakMessagePipeEndpoint};
pub use platform_handle::PlatformHandleDispatcher;
pub use shared_buffer::SharedBufferDispatcher;

use crate::error::SystemError;
use crate::signals::{Signals, SignalsState};
use crate::waiter::{ReadyWaiter, Registration, WaitCallback, WaiterId};

/// Which kind of resource a dispatcher is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherKind {
    /// One end of a message pipe.
    MessagePipe,
    /// A shared memory region.
    SharedBuffer,
    /// A wrapped OS descriptor.
    PlatformHandle,
}

impl std::fmt::Display for DispatcherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MessagePipe => "message pipe",
            Self::SharedBuffer => "shared buffer",
            Self::PlatformHandle => "platform handle",
        };
        f.write_str(name)
    }
}

/// A resource owned through a handle.
#[derive(Debug, Clone)]
pub enum Dispatcher {
    /// Message pipe endpoint.
    MessagePipe(MessagePipeEndpoint),
    /// Shared buffer.
    SharedBuffer(SharedBufferDispatcher),
    /// Wrapped platform handle.
    PlatformHandle(PlatformHandleDispatcher),
}

impl Dispatcher {
    /// The kind of this dispatcher.
    #[must_use]
    pub fn kind(&self) -> DispatcherKind {
        match self {
            Self::MessagePipe(_) => DispatcherKind::MessagePipe,
            Self::SharedBuffer(_) => DispatcherKind::SharedBuffer,
            Self::PlatformHandle(_) => DispatcherKind::PlatformHandle,
        }
    }

    /// Release the underlying resource.
    pub fn close(&self) {
        match self {
            Self::MessagePipe(endpoint) => endpoint.close(),
            Self::SharedBuffer(buffer) => buffer.close(),
            Self::PlatformHandle(handle) => handle.close(),
        }
    }

    /// Current readiness. Only message pipes ever become ready.
    #[must_use]
    pub fn signals_state(&self) -> SignalsState {
        match self {
            Self::MessagePipe(endpoint) => endpoint.signals_state(),
            Self::SharedBuffer(_) | Self::PlatformHandle(_) => SignalsState::never(),
        }
    }

    pub(crate) fn add_waiter(
        &self,
        id: WaiterId,
        signals: Signals,
        callback: WaitCallback,
    ) -> Registration {
        match self {
            Self::MessagePipe(endpoint) => endpoint.add_waiter(id, signals, callback),
            Self::SharedBuffer(_) | Self::PlatformHandle(_) => Registration::Ready(
                ReadyWaiter::new(
                    callback,
                    Err(SystemError::precondition(format!(
                        "a {} never signals",
                        self.kind()
                    ))),
                ),
            ),
        }
    }

    pub(crate) fn remove_waiter(&self, id: WaiterId) -> bool {
        match self {
            Self::MessagePipe(endpoint) => endpoint.remove_waiter(id),
            Self::SharedBuffer(_) | Self::PlatformHandle(_) => false,
        }
    }
}
