//! Message pipe endpoints.
//!
//! An endpoint is linked to exactly one peer. The peer is either another
//! endpoint in this process or a [`RemotePeer`] that proxies the far end over
//! a channel. An endpoint that is itself sent over a channel turns into a
//! forwarder: whatever its local peer writes is relayed to the remote side.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use super::Dispatcher;
use crate::error::{SystemError, SystemResult};
use crate::signals::{Signals, SignalsState};
use crate::sync::lock;
use crate::waiter::{self, Registration, WaitCallback, WaiterId, WaiterList};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// A message travelling through a pipe: bytes plus attached dispatchers.
#[derive(Debug, Default)]
pub struct Message {
    /// Payload.
    pub bytes: Vec<u8>,
    /// Dispatchers transferred with the message.
    pub dispatchers: Vec<Dispatcher>,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(bytes: Vec<u8>, dispatchers: Vec<Dispatcher>) -> Self {
        Self { bytes, dispatchers }
    }
}

/// The far end of a pipe living on the other side of a channel.
///
/// Implementations must not block and must not call back into the endpoint
/// that owns them.
pub trait RemotePeer: Send + Sync + fmt::Debug {
    /// Queue `message` for delivery to the remote endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::FailedPrecondition`] if the channel no longer
    /// accepts sends, or [`SystemError::InvalidArgument`] if an attachment
    /// cannot be transferred.
    fn send(&self, message: Message) -> SystemResult<()>;

    /// Tell the remote side that this end is gone.
    fn close(&self);
}

enum Peer {
    Local(Weak<Endpoint>),
    Remote(Arc<dyn RemotePeer>),
    Gone,
}

enum Target {
    Local(Arc<Endpoint>),
    Remote(Arc<dyn RemotePeer>),
}

impl Target {
    fn deliver(self, message: Message) -> SystemResult<()> {
        match self {
            Self::Local(endpoint) => {
                endpoint.accept(message);
                Ok(())
            },
            Self::Remote(remote) => remote.send(message),
        }
    }
}

impl Peer {
    fn target(&self) -> Option<Target> {
        match self {
            Self::Local(weak) => weak.upgrade().map(Target::Local),
            Self::Remote(remote) => Some(Target::Remote(Arc::clone(remote))),
            Self::Gone => None,
        }
    }

    fn notify_closed(self) {
        match self {
            Self::Local(weak) => {
                if let Some(peer) = weak.upgrade() {
                    peer.on_peer_closed();
                }
            },
            Self::Remote(remote) => remote.close(),
            Self::Gone => {},
        }
    }
}

#[derive(Default)]
struct State {
    peer: Option<Peer>,
    queue: VecDeque<Message>,
    peer_closed: bool,
    closed: bool,
    forward: Option<Arc<dyn RemotePeer>>,
    waiters: WaiterList,
}

impl State {
    fn take_peer(&mut self) -> Peer {
        self.peer.take().unwrap_or(Peer::Gone)
    }

    fn signals(&self) -> SignalsState {
        let mut satisfied = Signals::empty();
        let mut satisfiable = Signals::PEER_CLOSED;
        if !self.queue.is_empty() {
            satisfied |= Signals::READABLE;
            satisfiable |= Signals::READABLE;
        }
        if self.peer_closed {
            satisfied |= Signals::PEER_CLOSED;
        } else {
            satisfied |= Signals::WRITABLE;
            satisfiable |= Signals::READABLE | Signals::WRITABLE;
        }
        SignalsState {
            satisfied,
            satisfiable,
        }
    }
}

struct Endpoint {
    id: u64,
    state: Mutex<State>,
}

impl Endpoint {
    fn new(peer: Peer) -> Self {
        Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State {
                peer: Some(peer),
                ..State::default()
            }),
        }
    }

    fn accept(&self, message: Message) {
        let mut state = lock(&self.state);
        if state.closed {
            drop(state);
            trace!(endpoint = self.id, "dropping message for closed endpoint");
            drop(message);
            return;
        }
        if let Some(forward) = &state.forward {
            // Forwarding happens under the lock so relayed messages keep their order.
            if let Err(e) = forward.send(message) {
                debug!(endpoint = self.id, error = %e, "failed to forward message");
            }
            return;
        }
        state.queue.push_back(message);
        let signals = state.signals();
        let ready = state.waiters.take_ready(signals);
        drop(state);
        waiter::fire_all(ready);
    }

    fn on_peer_closed(&self) {
        let mut state = lock(&self.state);
        if state.closed || state.peer_closed {
            return;
        }
        state.peer_closed = true;
        state.peer = Some(Peer::Gone);
        if let Some(forward) = state.forward.take() {
            state.closed = true;
            drop(state);
            forward.close();
            return;
        }
        let signals = state.signals();
        let ready = state.waiters.take_ready(signals);
        drop(state);
        waiter::fire_all(ready);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.closed = true;
        let peer = state.take_peer();
        let forward = state.forward.take();
        let cancelled = state.waiters.cancel_all();
        waiter::fire_all(cancelled);
        if let Some(forward) = forward {
            forward.close();
        }
        peer.notify_closed();
    }
}

/// One end of a message pipe.
#[derive(Clone)]
pub struct MessagePipeEndpoint {
    inner: Arc<Endpoint>,
}

/// A non-owning reference to an endpoint.
#[derive(Clone)]
pub struct WeakMessagePipeEndpoint(Weak<Endpoint>);

impl WeakMessagePipeEndpoint {
    /// Recover the endpoint if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<MessagePipeEndpoint> {
        self.0.upgrade().map(|inner| MessagePipeEndpoint { inner })
    }
}

impl fmt::Debug for WeakMessagePipeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakMessagePipeEndpoint")
    }
}

impl MessagePipeEndpoint {
    /// Create two endpoints linked to each other.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let first = Arc::new(Endpoint::new(Peer::Gone));
        let second = Arc::new(Endpoint::new(Peer::Local(Arc::downgrade(&first))));
        lock(&first.state).peer = Some(Peer::Local(Arc::downgrade(&second)));
        (Self { inner: first }, Self { inner: second })
    }

    /// Create an endpoint whose peer lives on the far side of a channel.
    #[must_use]
    pub fn with_remote_peer(remote: Arc<dyn RemotePeer>) -> Self {
        Self {
            inner: Arc::new(Endpoint::new(Peer::Remote(remote))),
        }
    }

    /// Diagnostic identifier, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// A non-owning reference to this endpoint.
    #[must_use]
    pub fn downgrade(&self) -> WeakMessagePipeEndpoint {
        WeakMessagePipeEndpoint(Arc::downgrade(&self.inner))
    }

    /// Write a message to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::FailedPrecondition`] once the peer has closed,
    /// and [`SystemError::InvalidArgument`] if this endpoint is closed.
    pub fn write(&self, message: Message) -> SystemResult<()> {
        let target = {
            let state = lock(&self.inner.state);
            if state.closed || state.forward.is_some() {
                return Err(SystemError::invalid("endpoint is closed"));
            }
            if state.peer_closed {
                return Err(SystemError::precondition("peer endpoint closed"));
            }
            state.peer.as_ref().and_then(Peer::target)
        };
        match target {
            Some(target) => target.deliver(message),
            None => Err(SystemError::precondition("peer endpoint closed")),
        }
    }

    /// Read the oldest queued message.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ShouldWait`] when nothing is queued but the peer
    /// is open, and [`SystemError::FailedPrecondition`] when nothing is queued
    /// and the peer has closed.
    pub fn read(&self) -> SystemResult<Message> {
        let mut state = lock(&self.inner.state);
        if state.closed || state.forward.is_some() {
            return Err(SystemError::invalid("endpoint is closed"));
        }
        match state.queue.pop_front() {
            Some(message) => Ok(message),
            None if state.peer_closed => Err(SystemError::precondition("peer endpoint closed")),
            None => Err(SystemError::ShouldWait),
        }
    }

    /// Byte and attachment counts of the oldest queued message.
    ///
    /// # Errors
    ///
    /// Same conditions as [`MessagePipeEndpoint::read`].
    pub fn peek_sizes(&self) -> SystemResult<(usize, usize)> {
        let state = lock(&self.inner.state);
        if state.closed {
            return Err(SystemError::invalid("endpoint is closed"));
        }
        match state.queue.front() {
            Some(m) => Ok((m.bytes.len(), m.dispatchers.len())),
            None if state.peer_closed => Err(SystemError::precondition("peer endpoint closed")),
            None => Err(SystemError::ShouldWait),
        }
    }

    /// Current readiness.
    #[must_use]
    pub fn signals_state(&self) -> SignalsState {
        let state = lock(&self.inner.state);
        if state.closed {
            return SignalsState::never();
        }
        state.signals()
    }

    /// Deliver an inbound message into this endpoint's queue.
    ///
    /// Used by channels for messages that arrive from the remote peer.
    pub fn accept(&self, message: Message) {
        self.inner.accept(message);
    }

    /// Mark the peer as closed.
    pub fn peer_closed(&self) {
        self.inner.on_peer_closed();
    }

    /// Close this endpoint, dropping queued messages and cancelling waiters.
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return;
        }
        state.closed = true;
        let peer = state.take_peer();
        let queue = std::mem::take(&mut state.queue);
        let forward = state.forward.take();
        let cancelled = state.waiters.cancel_all();
        drop(state);

        waiter::fire_all(cancelled);
        drop(queue);
        if let Some(forward) = forward {
            forward.close();
        }
        peer.notify_closed();
    }

    /// Turn this endpoint into a forwarder for `remote`.
    ///
    /// Everything already queued is relayed first, in order, and every later
    /// message the local peer writes follows it. Waiters registered on the
    /// endpoint are cancelled since the handle left this process's table.
    pub fn start_forwarding(&self, remote: Arc<dyn RemotePeer>) {
        let mut state = lock(&self.inner.state);
        if state.closed {
            drop(state);
            remote.close();
            return;
        }
        let cancelled = state.waiters.cancel_all();
        for message in std::mem::take(&mut state.queue) {
            if let Err(e) = remote.send(message) {
                debug!(endpoint = self.inner.id, error = %e, "failed to relay queued message");
            }
        }
        if state.peer_closed {
            state.closed = true;
            drop(state);
            remote.close();
        } else {
            state.forward = Some(remote);
            drop(state);
        }
        waiter::fire_all(cancelled);
    }

    /// Relay a message that arrived from the remote side of a forwarder to
    /// its local peer.
    pub fn forward_to_peer(&self, message: Message) {
        let target = {
            let state = lock(&self.inner.state);
            if state.peer_closed {
                None
            } else {
                state.peer.as_ref().and_then(Peer::target)
            }
        };
        match target {
            Some(target) => {
                if let Err(e) = target.deliver(message) {
                    debug!(endpoint = self.inner.id, error = %e, "failed to relay inbound message");
                }
            },
            None => trace!(endpoint = self.inner.id, "dropping message for closed peer"),
        }
    }

    /// The remote side of a forwarder went away: stop forwarding and tell the
    /// local peer.
    pub fn detach(&self) {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return;
        }
        state.closed = true;
        state.forward = None;
        let peer = state.take_peer();
        drop(state);
        peer.notify_closed();
    }

    pub(crate) fn add_waiter(
        &self,
        id: WaiterId,
        signals: Signals,
        callback: WaitCallback,
    ) -> Registration {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Registration::Ready(waiter::ReadyWaiter::new(
                callback,
                Err(SystemError::Cancelled),
            ));
        }
        let current = state.signals();
        state.waiters.register(id, signals, callback, current)
    }

    pub(crate) fn remove_waiter(&self, id: WaiterId) -> bool {
        lock(&self.inner.state).waiters.remove(id)
    }
}

impl fmt::Debug for MessagePipeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePipeEndpoint")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct RecordingRemote {
        sent: StdMutex<Vec<Vec<u8>>>,
        closed: StdMutex<bool>,
    }

    impl RemotePeer for RecordingRemote {
        fn send(&self, message: Message) -> SystemResult<()> {
            self.sent.lock().unwrap().push(message.bytes);
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn msg(bytes: &[u8]) -> Message {
        Message::new(bytes.to_vec(), Vec::new())
    }

    #[test]
    fn test_write_read_in_order() {
        let (a, b) = MessagePipeEndpoint::pair();
        a.write(msg(b"one")).unwrap();
        a.write(msg(b"two")).unwrap();
        assert_eq!(b.read().unwrap().bytes, b"one");
        assert_eq!(b.read().unwrap().bytes, b"two");
        assert_eq!(b.read().unwrap_err(), SystemError::ShouldWait);
    }

    #[test]
    fn test_peer_closed_semantics() {
        let (a, b) = MessagePipeEndpoint::pair();
        a.write(msg(b"last")).unwrap();
        a.close();

        let state = b.signals_state();
        assert!(state.satisfied.contains(Signals::PEER_CLOSED | Signals::READABLE));
        assert!(!state.satisfiable.contains(Signals::WRITABLE));

        assert_eq!(b.read().unwrap().bytes, b"last");
        assert!(matches!(b.read(), Err(SystemError::FailedPrecondition(_))));
        assert!(matches!(b.write(msg(b"x")), Err(SystemError::FailedPrecondition(_))));
    }

    #[test]
    fn test_drop_signals_peer() {
        let (a, b) = MessagePipeEndpoint::pair();
        drop(a);
        assert!(b.signals_state().satisfied.contains(Signals::PEER_CLOSED));
    }

    #[test]
    fn test_closed_endpoint_rejects_use() {
        let (a, _b) = MessagePipeEndpoint::pair();
        a.close();
        assert!(matches!(a.read(), Err(SystemError::InvalidArgument(_))));
        assert!(matches!(a.write(msg(b"x")), Err(SystemError::InvalidArgument(_))));
        assert_eq!(a.signals_state(), SignalsState::never());
    }

    #[test]
    fn test_forwarding_relays_queue_then_new_writes() {
        let (a, b) = MessagePipeEndpoint::pair();
        a.write(msg(b"queued")).unwrap();

        let remote = Arc::new(RecordingRemote::default());
        b.start_forwarding(Arc::clone(&remote) as Arc<dyn RemotePeer>);
        a.write(msg(b"later")).unwrap();

        assert_eq!(
            remote.sent.lock().unwrap().as_slice(),
            &[b"queued".to_vec(), b"later".to_vec()]
        );

        a.close();
        assert!(*remote.closed.lock().unwrap());
    }

    #[test]
    fn test_forward_to_peer_and_detach() {
        let (a, b) = MessagePipeEndpoint::pair();
        let remote = Arc::new(RecordingRemote::default());
        b.start_forwarding(remote);

        b.forward_to_peer(msg(b"from afar"));
        assert_eq!(a.read().unwrap().bytes, b"from afar");

        b.detach();
        assert!(a.signals_state().satisfied.contains(Signals::PEER_CLOSED));
    }

    #[test]
    fn test_remote_peer_receives_writes() {
        let remote = Arc::new(RecordingRemote::default());
        let endpoint =
            MessagePipeEndpoint::with_remote_peer(Arc::clone(&remote) as Arc<dyn RemotePeer>);
        endpoint.write(msg(b"hi")).unwrap();
        endpoint.accept(msg(b"back"));
        assert_eq!(endpoint.read().unwrap().bytes, b"back");
        endpoint.close();
        assert!(*remote.closed.lock().unwrap());
        assert_eq!(remote.sent.lock().unwrap().len(), 1);
    }
}
