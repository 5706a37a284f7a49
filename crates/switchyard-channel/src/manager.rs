//! The [`ChannelManager`]: creates, drains and destroys channels.

use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use switchyard_system::{Core, Dispatcher, Handle};
use tracing::{debug, error, info, warn};

use crate::bootstrap::{ChannelDelegate, ChannelOptions};
use crate::channel::{Channel, ChannelState};
use crate::error::{ChannelError, ChannelResult};
use crate::id::{ChannelId, ChannelIdAllocator};
use crate::io_thread::IoThreadHandle;

/// Owns every channel of one process.
///
/// Creation may be requested from any thread; the socket is always bound and
/// torn down on the IO thread, in the order the requests were made.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

struct Inner {
    core: Arc<Core>,
    io: IoThreadHandle,
    ids: ChannelIdAllocator,
    channels: DashMap<ChannelId, Arc<Channel>>,
    delegate: Mutex<Option<Arc<dyn ChannelDelegate>>>,
}

impl ChannelManager {
    /// Create a manager whose channels add their endpoints to `core` and run
    /// their I/O on `io`.
    #[must_use]
    pub fn new(core: Arc<Core>, io: IoThreadHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                core,
                io,
                ids: ChannelIdAllocator::new(),
                channels: DashMap::new(),
                delegate: Mutex::new(None),
            }),
        }
    }

    /// Receive errors from every channel created after this call.
    pub fn set_delegate(&self, delegate: Arc<dyn ChannelDelegate>) {
        *self
            .inner
            .delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delegate);
    }

    /// The core channel endpoints are added to.
    #[must_use]
    pub fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    /// The IO thread.
    #[must_use]
    pub fn io_thread(&self) -> &IoThreadHandle {
        &self.inner.io
    }

    /// Wrap `socket` in a new channel and return its id and primary pipe.
    ///
    /// May be called from any thread. The socket is attached on the IO
    /// thread; messages written to the primary pipe before that are queued.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::System`] if the handle table is full and
    /// [`ChannelError::IoThreadStopped`] after shutdown.
    pub fn create_channel(
        &self,
        socket: OwnedFd,
        options: ChannelOptions,
    ) -> ChannelResult<(ChannelId, Handle)> {
        let (channel, handle) = self.register(options)?;
        let id = channel.id();
        let attached = Arc::clone(&channel);
        if let Err(e) = self.inner.io.post(move || attached.attach(socket)) {
            self.inner.channels.remove(&id);
            channel.destroy();
            let _ = self.inner.core.close(handle);
            return Err(e);
        }
        Ok((id, handle))
    }

    /// Same as [`ChannelManager::create_channel`], attaching immediately.
    /// Must be called on the IO thread.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::System`] if the handle table is full.
    pub fn create_channel_on_io_thread(
        &self,
        socket: OwnedFd,
        options: ChannelOptions,
    ) -> ChannelResult<(ChannelId, Handle)> {
        debug_assert!(
            self.inner.io.runs_tasks_on_current_thread(),
            "create_channel_on_io_thread called off the IO thread"
        );
        let (channel, handle) = self.register(options)?;
        channel.attach(socket);
        Ok((channel.id(), handle))
    }

    fn register(&self, options: ChannelOptions) -> ChannelResult<(Arc<Channel>, Handle)> {
        let id = self.inner.ids.allocate();
        let delegate = self
            .inner
            .delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (channel, primary) = Channel::new(id, options, delegate);
        let handle = match self.inner.core.add_dispatcher(Dispatcher::MessagePipe(primary)) {
            Ok(handle) => handle,
            Err(e) => {
                channel.destroy();
                return Err(e.into());
            },
        };
        self.inner.channels.insert(id, Arc::clone(&channel));
        debug!(channel = %id, primary = %handle, "channel created");
        Ok((channel, handle))
    }

    /// Stop admitting new sends on `id`; frames already queued still go out.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnknownChannel`] if `id` does not exist.
    pub fn will_destroy_channel(&self, id: ChannelId) -> ChannelResult<()> {
        let channel = self
            .inner
            .channels
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ChannelError::UnknownChannel(id))?;
        channel.will_destroy();
        Ok(())
    }

    /// Tear down channel `id`. Must be called on the IO thread.
    ///
    /// Destroying an unknown or already destroyed channel is a bug: it
    /// panics in debug builds and is logged and ignored otherwise.
    pub fn destroy_channel(&self, id: ChannelId) {
        debug_assert!(
            self.inner.io.runs_tasks_on_current_thread(),
            "destroy_channel called off the IO thread"
        );
        let known = self.destroy_known(id).is_some();
        debug_assert!(known, "destroying unknown channel {id}");
        if !known {
            error!(channel = %id, "destroying unknown channel");
        }
    }

    /// Post [`ChannelManager::destroy_channel`] to the IO thread.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::IoThreadStopped`] after shutdown.
    pub fn post_destroy_channel(&self, id: ChannelId) -> ChannelResult<()> {
        let manager = self.clone();
        self.inner.io.post(move || manager.destroy_channel(id))
    }

    pub(crate) fn destroy_known(&self, id: ChannelId) -> Option<Arc<Channel>> {
        let (_, channel) = self.inner.channels.remove(&id)?;
        channel.destroy().then_some(channel)
    }

    /// Current state of channel `id`, or `None` once it has been destroyed.
    #[must_use]
    pub fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
        self.inner.channels.get(&id).map(|entry| entry.value().state())
    }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Drain and destroy every channel, waiting up to `flush_timeout` per
    /// channel for queued frames to reach the socket.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::IoThreadStopped`] if the IO thread is gone.
    pub fn shutdown(&self, flush_timeout: Duration) -> ChannelResult<()> {
        let ids: Vec<ChannelId> = self.inner.channels.iter().map(|e| *e.key()).collect();
        if ids.is_empty() {
            return Ok(());
        }
        for id in &ids {
            let _ = self.will_destroy_channel(*id);
        }

        let manager = self.clone();
        let destroyed: Vec<Arc<Channel>> = self.inner.io.post_and_wait(move || {
            ids.into_iter()
                .filter_map(|id| manager.destroy_known(id))
                .collect()
        })?;

        if self.inner.io.runs_tasks_on_current_thread() {
            warn!("channel shutdown on the IO thread; not waiting for flush");
            return Ok(());
        }
        for channel in &destroyed {
            if !channel.wait_flushed(flush_timeout) {
                warn!(channel = %channel.id(), "timed out flushing channel");
            }
        }
        info!(count = destroyed.len(), "channels shut down");
        Ok(())
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.inner.channels.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{ChannelObserver, ConnectionId};
    use crate::io_thread::IoThread;
    use crate::platform::PlatformChannelPair;
    use std::sync::mpsc;
    use switchyard_system::{Signals, SystemError, SystemLimits};

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Side {
        manager: ChannelManager,
        core: Arc<Core>,
        _io: IoThread,
    }

    impl Side {
        fn new(name: &str) -> Self {
            let io = IoThread::spawn(name).unwrap();
            let core = Arc::new(Core::new(SystemLimits::default()).unwrap());
            Self {
                manager: ChannelManager::new(Arc::clone(&core), io.handle()),
                core,
                _io: io,
            }
        }

        fn read(&self, handle: Handle) -> switchyard_system::ReadMessage {
            self.core
                .wait(handle, Signals::READABLE, Some(TIMEOUT))
                .unwrap();
            self.core.read_message(handle).unwrap()
        }

        fn wait_peer_closed(&self, handle: Handle) {
            let state = self
                .core
                .wait(handle, Signals::PEER_CLOSED, Some(TIMEOUT))
                .unwrap();
            assert!(state.satisfied.contains(Signals::PEER_CLOSED));
        }
    }

    fn connect(
        a: &Side,
        a_opts: ChannelOptions,
        b: &Side,
        b_opts: ChannelOptions,
    ) -> ((ChannelId, Handle), (ChannelId, Handle)) {
        let (fa, fb) = PlatformChannelPair::new().unwrap().into_parts();
        (
            a.manager.create_channel(fa, a_opts).unwrap(),
            b.manager.create_channel(fb, b_opts).unwrap(),
        )
    }

    struct Recorder {
        tx: Mutex<mpsc::Sender<String>>,
    }

    impl Recorder {
        fn with_sender(tx: mpsc::Sender<String>) -> Arc<Self> {
            Arc::new(Self { tx: Mutex::new(tx) })
        }

        fn record(&self, event: String) {
            let _ = self.tx.lock().unwrap().send(event);
        }
    }

    impl ChannelObserver for Recorder {
        fn on_connected(&self, _id: ChannelId) {
            self.record("connected".to_owned());
        }

        fn on_error(&self, _id: ChannelId, error: &ChannelError) {
            let kind = match error {
                ChannelError::Handshake(_) => "handshake",
                ChannelError::PeerClosed => "peer_closed",
                _ => "other",
            };
            self.record(format!("error:{kind}"));
        }
    }

    impl ChannelDelegate for Recorder {
        fn on_channel_error(&self, _id: ChannelId, _error: &ChannelError) {
            self.record("delegate".to_owned());
        }
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let a = Side::new("io-a");
        let b = Side::new("io-b");
        let ((_, ha), (_, hb)) = connect(&a, ChannelOptions::new(), &b, ChannelOptions::new());

        for i in 0..100u32 {
            a.core.write_message(ha, i.to_be_bytes().to_vec(), &[]).unwrap();
        }
        for i in 0..100u32 {
            assert_eq!(b.read(hb).bytes, i.to_be_bytes());
        }

        b.core.write_message(hb, b"pong".to_vec(), &[]).unwrap();
        assert_eq!(a.read(ha).bytes, b"pong");
    }

    #[test]
    fn test_pipe_attachment_is_proxied_both_ways() {
        let a = Side::new("io-a");
        let b = Side::new("io-b");
        let ((_, ha), (_, hb)) = connect(&a, ChannelOptions::new(), &b, ChannelOptions::new());

        let (local, sent) = a.core.create_message_pipe().unwrap();
        a.core.write_message(local, b"early".to_vec(), &[]).unwrap();
        a.core.write_message(ha, b"take this".to_vec(), &[sent]).unwrap();
        assert!(a.core.get_dispatcher(sent).is_err());

        let msg = b.read(hb);
        assert_eq!(msg.bytes, b"take this");
        let remote = msg.handles[0];
        assert_eq!(b.read(remote).bytes, b"early");

        a.core.write_message(local, b"to b".to_vec(), &[]).unwrap();
        assert_eq!(b.read(remote).bytes, b"to b");
        b.core.write_message(remote, b"to a".to_vec(), &[]).unwrap();
        assert_eq!(a.read(local).bytes, b"to a");

        a.core.close(local).unwrap();
        b.wait_peer_closed(remote);
    }

    #[test]
    fn test_shared_buffer_crosses_channel() {
        let a = Side::new("io-a");
        let b = Side::new("io-b");
        let ((_, ha), (_, hb)) = connect(&a, ChannelOptions::new(), &b, ChannelOptions::new());

        let buffer = a.core.create_shared_buffer(64).unwrap();
        a.core.shared_buffer(buffer).unwrap().write_at(8, b"region").unwrap();
        a.core.write_message(ha, b"buf".to_vec(), &[buffer]).unwrap();

        let msg = b.read(hb);
        let received = b.core.shared_buffer(msg.handles[0]).unwrap();
        assert_eq!(received.num_bytes(), 64);
        assert_eq!(received.read_at(8, 6).unwrap(), b"region");
    }

    #[test]
    fn test_drain_then_destroy_flushes_queued_messages() {
        let a = Side::new("io-a");
        let b = Side::new("io-b");
        let ((ida, ha), (_, hb)) = connect(&a, ChannelOptions::new(), &b, ChannelOptions::new());

        for i in 0..50u32 {
            a.core.write_message(ha, i.to_be_bytes().to_vec(), &[]).unwrap();
        }
        a.manager.will_destroy_channel(ida).unwrap();
        assert_eq!(a.manager.channel_state(ida), Some(ChannelState::Draining));
        assert!(matches!(
            a.core.write_message(ha, b"late".to_vec(), &[]),
            Err(SystemError::FailedPrecondition(_))
        ));
        a.manager.post_destroy_channel(ida).unwrap();

        for i in 0..50u32 {
            assert_eq!(b.read(hb).bytes, i.to_be_bytes());
        }
        b.wait_peer_closed(hb);
        a.wait_peer_closed(ha);
        assert_eq!(a.manager.channel_state(ida), None);
    }

    #[test]
    fn test_channel_ids_are_not_reused() {
        let a = Side::new("io-a");
        let (fd, _peer) = PlatformChannelPair::new().unwrap().into_parts();
        let (first, _) = a.manager.create_channel(fd, ChannelOptions::new()).unwrap();
        let manager = a.manager.clone();
        assert!(a
            .manager
            .io_thread()
            .post_and_wait(move || manager.destroy_known(first).is_some())
            .unwrap());

        let (fd, _peer) = PlatformChannelPair::new().unwrap().into_parts();
        let (second, _) = a.manager.create_channel(fd, ChannelOptions::new()).unwrap();
        assert_ne!(first, second);
        assert!(second < first);

        let manager = a.manager.clone();
        assert!(!a
            .manager
            .io_thread()
            .post_and_wait(move || manager.destroy_known(first).is_some())
            .unwrap());
    }

    #[test]
    fn test_handshake_accepts_matching_id() {
        let a = Side::new("io-host");
        let b = Side::new("io-child");
        let (tx, rx) = mpsc::channel();
        let host_observer = Recorder::with_sender(tx);
        let id = ConnectionId::generate();
        let ((_, ha), (_, hb)) = connect(
            &a,
            ChannelOptions::new()
                .expect_connection_id(id.clone())
                .with_observer(host_observer),
            &b,
            ChannelOptions::new().announce_connection_id(id),
        );

        b.core.write_message(hb, b"after hello".to_vec(), &[]).unwrap();
        assert_eq!(a.read(ha).bytes, b"after hello");
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "connected");
    }

    #[test]
    fn test_handshake_rejects_wrong_id() {
        let a = Side::new("io-host");
        let b = Side::new("io-child");
        let (tx, rx) = mpsc::channel();
        let recorder = Recorder::with_sender(tx);
        a.manager.set_delegate(Arc::clone(&recorder) as Arc<dyn ChannelDelegate>);
        let ((_, ha), (_, hb)) = connect(
            &a,
            ChannelOptions::new()
                .expect_connection_id(ConnectionId::generate())
                .with_observer(recorder),
            &b,
            ChannelOptions::new().announce_connection_id(ConnectionId::generate()),
        );

        b.core.write_message(hb, b"sneaky".to_vec(), &[]).unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "error:handshake");
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "delegate");
        a.wait_peer_closed(ha);
        assert!(matches!(
            a.core.read_message(ha),
            Err(SystemError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn test_transport_loss_notifies_and_closes_pipes() {
        let a = Side::new("io-a");
        let (tx, rx) = mpsc::channel();
        let recorder = Recorder::with_sender(tx);
        a.manager.set_delegate(Arc::clone(&recorder) as Arc<dyn ChannelDelegate>);
        let (fd, peer) = PlatformChannelPair::new().unwrap().into_parts();
        let (_, handle) = a
            .manager
            .create_channel(fd, ChannelOptions::new().with_observer(recorder))
            .unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "connected");

        drop(peer);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "error:peer_closed");
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "delegate");
        a.wait_peer_closed(handle);
    }

    #[test]
    fn test_writes_before_attach_are_queued() {
        let a = Side::new("io-a");
        let b = Side::new("io-b");
        let (fa, fb) = PlatformChannelPair::new().unwrap().into_parts();

        // Hold the IO thread so the attach cannot run yet.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        a.manager
            .io_thread()
            .post(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        let (_, ha) = a.manager.create_channel(fa, ChannelOptions::new()).unwrap();
        a.core.write_message(ha, b"queued".to_vec(), &[]).unwrap();
        release_tx.send(()).unwrap();

        let (_, hb) = b.manager.create_channel(fb, ChannelOptions::new()).unwrap();
        assert_eq!(b.read(hb).bytes, b"queued");
    }

    #[test]
    fn test_shutdown_destroys_everything() {
        let a = Side::new("io-a");
        let b = Side::new("io-b");
        let ((_, ha), (_, hb)) = connect(&a, ChannelOptions::new(), &b, ChannelOptions::new());
        a.core.write_message(ha, b"bye".to_vec(), &[]).unwrap();

        a.manager.shutdown(TIMEOUT).unwrap();
        assert_eq!(a.manager.channel_count(), 0);
        assert_eq!(b.read(hb).bytes, b"bye");
        b.wait_peer_closed(hb);
    }
}
