//! One channel: a socket carrying many multiplexed message pipes.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak, mpsc};
use std::time::Duration;

use nix::sys::socket::{Shutdown, shutdown};
use switchyard_system::{
    Dispatcher, Message, MessagePipeEndpoint, PlatformHandleDispatcher, RemotePeer,
    SharedBufferDispatcher, SystemError, SystemResult, WeakMessagePipeEndpoint,
};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bootstrap::{ChannelDelegate, ChannelObserver, ChannelOptions, ConnectionId, Handshake};
use crate::error::{ChannelError, ChannelResult};
use crate::frame::{Attachment, EndpointKey, Frame, FrameDecoder, FrameHeader, MAX_FDS_PER_FRAME};
use crate::id::ChannelId;
use crate::platform::{recv_with_fds, send_with_fds};

const READ_CHUNK: usize = 65_536;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting sends.
    Running,
    /// No new sends; queued frames still go out.
    Draining,
    /// Torn down.
    Destroyed,
}

enum Outbound {
    Frame { bytes: Vec<u8>, fds: Vec<OwnedFd> },
    Shutdown,
}

#[derive(Clone)]
enum Route {
    /// A local endpoint whose peer is on the other side.
    Endpoint(WeakMessagePipeEndpoint),
    /// A local endpoint that was sent to the other side and now relays for
    /// its local peer.
    Forwarder(MessagePipeEndpoint),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel internals. Shared between the manager, the IO tasks and the
/// [`ChannelPort`]s of proxied endpoints.
pub(crate) struct Channel {
    id: ChannelId,
    weak_self: Weak<Channel>,
    state: Mutex<ChannelState>,
    failed: AtomicBool,
    outbound: tokio_mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<tokio_mpsc::UnboundedReceiver<Outbound>>>,
    flushed_tx: Mutex<Option<mpsc::Sender<()>>>,
    flushed_rx: Mutex<mpsc::Receiver<()>>,
    routes: Mutex<HashMap<EndpointKey, Route>>,
    next_key: AtomicU64,
    awaiting_hello: Mutex<Option<ConnectionId>>,
    observer: Option<Arc<dyn ChannelObserver>>,
    delegate: Option<Arc<dyn ChannelDelegate>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// The remote half of an endpoint proxied over a channel.
#[derive(Debug)]
struct ChannelPort {
    channel: Weak<Channel>,
    key: EndpointKey,
}

impl RemotePeer for ChannelPort {
    fn send(&self, message: Message) -> SystemResult<()> {
        match self.channel.upgrade() {
            Some(channel) => channel.send_message(self.key, message),
            None => Err(SystemError::FailedPrecondition("channel is gone".to_owned())),
        }
    }

    fn close(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.close_route(self.key);
        }
    }
}

impl Channel {
    /// Create a channel and its primary endpoint. Nothing touches the socket
    /// until [`Channel::attach`] runs on the IO thread.
    pub(crate) fn new(
        id: ChannelId,
        options: ChannelOptions,
        delegate: Option<Arc<dyn ChannelDelegate>>,
    ) -> (Arc<Self>, MessagePipeEndpoint) {
        let (outbound, outbound_rx) = tokio_mpsc::unbounded_channel();
        let (flushed_tx, flushed_rx) = mpsc::channel();
        let ChannelOptions { handshake, observer } = options;
        let awaiting_hello = match &handshake {
            Handshake::Expect(expected) => Some(expected.clone()),
            Handshake::None | Handshake::Announce(_) => None,
        };

        let channel = Arc::new_cyclic(|weak_self| Self {
            id,
            weak_self: weak_self.clone(),
            state: Mutex::new(ChannelState::Running),
            failed: AtomicBool::new(false),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            flushed_tx: Mutex::new(Some(flushed_tx)),
            flushed_rx: Mutex::new(flushed_rx),
            routes: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            awaiting_hello: Mutex::new(awaiting_hello),
            observer,
            delegate,
            reader: Mutex::new(None),
        });

        if let Handshake::Announce(connection_id) = handshake {
            let hello = FrameHeader::Hello {
                connection_id: connection_id.as_str().to_owned(),
            };
            if let Err(e) = channel.enqueue(hello) {
                warn!(channel = %id, error = %e, "failed to queue hello");
            }
        }

        let primary = channel.proxied_endpoint(EndpointKey::Primary);
        (channel, primary)
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    /// Bind the socket and start the reader and writer. Must run inside the
    /// IO thread's runtime.
    pub(crate) fn attach(self: &Arc<Self>, fd: OwnedFd) {
        if self.state() == ChannelState::Destroyed {
            debug!(channel = %self.id, "channel destroyed before attach");
            return;
        }
        let stream = match Self::into_stream(fd) {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                self.fail(e);
                return;
            },
        };
        let (Some(outbound_rx), Some(flushed_tx)) =
            (lock(&self.outbound_rx).take(), lock(&self.flushed_tx).take())
        else {
            warn!(channel = %self.id, "channel attached twice");
            return;
        };

        tokio::spawn(write_loop(
            Arc::clone(self),
            Arc::clone(&stream),
            outbound_rx,
            flushed_tx,
        ));
        *lock(&self.reader) = Some(tokio::spawn(read_loop(Arc::clone(self), stream)));
        debug!(channel = %self.id, "channel attached");

        if lock(&self.awaiting_hello).is_none() {
            self.notify_connected();
        }
    }

    fn into_stream(fd: OwnedFd) -> ChannelResult<UnixStream> {
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        Ok(UnixStream::from_std(std_stream)?)
    }

    /// Stop admitting sends. Frames already queued still go out.
    pub(crate) fn will_destroy(&self) {
        let mut state = lock(&self.state);
        if *state == ChannelState::Running {
            *state = ChannelState::Draining;
            debug!(channel = %self.id, "channel draining");
        }
    }

    /// Tear the channel down. Returns false if it was already destroyed.
    pub(crate) fn destroy(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == ChannelState::Destroyed {
                return false;
            }
            *state = ChannelState::Destroyed;
        }
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        // The writer flushes everything queued ahead of this marker.
        let _ = self.outbound.send(Outbound::Shutdown);
        // Never attached: nothing can be flushed.
        lock(&self.outbound_rx).take();
        lock(&self.flushed_tx).take();
        self.tear_down_routes();
        debug!(channel = %self.id, "channel destroyed");
        true
    }

    /// Block until the writer has flushed and shut the socket down, or the
    /// timeout expires. Must not be called on the IO thread.
    pub(crate) fn wait_flushed(&self, timeout: Duration) -> bool {
        match lock(&self.flushed_rx).recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }

    fn proxied_endpoint(&self, key: EndpointKey) -> MessagePipeEndpoint {
        let endpoint = MessagePipeEndpoint::with_remote_peer(Arc::new(ChannelPort {
            channel: self.weak_self.clone(),
            key,
        }));
        lock(&self.routes).insert(key, Route::Endpoint(endpoint.downgrade()));
        endpoint
    }

    fn accepting(&self, state: ChannelState) -> bool {
        state == ChannelState::Running && !self.failed.load(Ordering::Acquire)
    }

    /// Encode and queue a control frame. Callers that care about drain
    /// ordering hold the state lock.
    fn enqueue(&self, header: FrameHeader) -> ChannelResult<()> {
        let bytes = Frame {
            header,
            payload: Vec::new(),
            fds: Vec::new(),
        }
        .encode()?;
        self.outbound
            .send(Outbound::Frame {
                bytes,
                fds: Vec::new(),
            })
            .map_err(|_| ChannelError::Protocol(format!("channel {} writer is gone", self.id)))
    }

    /// Send a message written to the local half of `key`.
    fn send_message(&self, key: EndpointKey, message: Message) -> SystemResult<()> {
        let Message { bytes, dispatchers } = message;
        let fd_count = dispatchers
            .iter()
            .filter(|d| !matches!(d, Dispatcher::MessagePipe(_)))
            .count();
        if fd_count > MAX_FDS_PER_FRAME {
            return Err(SystemError::InvalidArgument(format!(
                "{fd_count} descriptors exceed the per-message limit of {MAX_FDS_PER_FRAME}"
            )));
        }

        let state = lock(&self.state);
        if !self.accepting(*state) {
            return Err(SystemError::FailedPrecondition(format!(
                "channel {} is not accepting messages",
                self.id
            )));
        }

        // Everything that can fail happens before any attachment is consumed,
        // so a rejected write leaves the caller's handles intact.
        let mut attachments = Vec::with_capacity(dispatchers.len());
        let mut buffer_fds = VecDeque::new();
        let mut forwarders = Vec::new();
        for dispatcher in &dispatchers {
            match dispatcher {
                Dispatcher::MessagePipe(endpoint) => {
                    let key = EndpointKey::Local(self.next_key.fetch_add(1, Ordering::Relaxed));
                    forwarders.push((endpoint.clone(), key));
                    attachments.push(Attachment::Pipe { key });
                },
                Dispatcher::SharedBuffer(buffer) => {
                    buffer_fds.push_back(buffer.to_fd()?);
                    attachments.push(Attachment::SharedBuffer {
                        num_bytes: buffer.num_bytes(),
                    });
                },
                Dispatcher::PlatformHandle(handle) => {
                    if handle.raw_fd().is_none() {
                        return Err(SystemError::InvalidArgument(
                            "platform handle was already passed".to_owned(),
                        ));
                    }
                    attachments.push(Attachment::PlatformHandle);
                },
            }
        }
        let header = FrameHeader::Message {
            target: key,
            attachments,
        };
        let frame_bytes = Frame {
            header,
            payload: bytes,
            fds: Vec::new(),
        }
        .encode()
        .map_err(|e| SystemError::ResourceExhausted(e.to_string()))?;

        let mut fds: Vec<OwnedFd> = Vec::with_capacity(fd_count);
        for dispatcher in dispatchers {
            match dispatcher {
                Dispatcher::MessagePipe(_) => {},
                Dispatcher::SharedBuffer(buffer) => {
                    fds.extend(buffer_fds.pop_front());
                    buffer.close();
                },
                Dispatcher::PlatformHandle(handle) => fds.push(handle.take()?),
            }
        }
        if self
            .outbound
            .send(Outbound::Frame {
                bytes: frame_bytes,
                fds,
            })
            .is_err()
        {
            return Err(SystemError::FailedPrecondition(format!(
                "channel {} writer is gone",
                self.id
            )));
        }
        {
            let mut routes = lock(&self.routes);
            for (endpoint, key) in &forwarders {
                routes.insert(*key, Route::Forwarder(endpoint.clone()));
            }
        }
        drop(state);

        for (endpoint, key) in forwarders {
            endpoint.start_forwarding(Arc::new(ChannelPort {
                channel: self.weak_self.clone(),
                key,
            }));
        }
        Ok(())
    }

    /// The local half of `key` went away: forget it and tell the remote side.
    fn close_route(&self, key: EndpointKey) {
        let removed = lock(&self.routes).remove(&key);
        if removed.is_none() {
            return;
        }
        drop(removed);
        let state = lock(&self.state);
        if *state == ChannelState::Destroyed || self.failed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.enqueue(FrameHeader::ClosePipe { target: key }) {
            debug!(channel = %self.id, error = %e, "failed to queue pipe close");
        }
    }

    fn handle_frame(&self, frame: Frame) -> ChannelResult<()> {
        let Frame {
            header,
            payload,
            fds,
        } = frame;

        {
            let mut awaiting = lock(&self.awaiting_hello);
            if let Some(expected) = awaiting.as_ref() {
                return match header {
                    FrameHeader::Hello { connection_id } if connection_id == expected.as_str() => {
                        *awaiting = None;
                        drop(awaiting);
                        debug!(channel = %self.id, "bootstrap handshake complete");
                        self.notify_connected();
                        Ok(())
                    },
                    FrameHeader::Hello { .. } => Err(ChannelError::Handshake(
                        "peer announced the wrong connection id".to_owned(),
                    )),
                    _ => Err(ChannelError::Handshake(
                        "frame received before the bootstrap hello".to_owned(),
                    )),
                };
            }
        }

        match header {
            FrameHeader::Hello { .. } => {
                debug!(channel = %self.id, "ignoring unexpected hello");
                Ok(())
            },
            FrameHeader::Message {
                target,
                attachments,
            } => self.deliver(target.flipped(), attachments, payload, fds),
            FrameHeader::ClosePipe { target } => {
                self.on_remote_close(target.flipped());
                Ok(())
            },
        }
    }

    fn deliver(
        &self,
        target: EndpointKey,
        attachments: Vec<Attachment>,
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
    ) -> ChannelResult<()> {
        let mut fds = fds.into_iter();
        let mut dispatchers = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let dispatcher = match attachment {
                Attachment::Pipe { key } => {
                    Dispatcher::MessagePipe(self.proxied_endpoint(key.flipped()))
                },
                Attachment::SharedBuffer { num_bytes } => {
                    let fd = fds.next().ok_or_else(missing_fd)?;
                    Dispatcher::SharedBuffer(SharedBufferDispatcher::from_fd(fd, num_bytes)?)
                },
                Attachment::PlatformHandle => {
                    let fd = fds.next().ok_or_else(missing_fd)?;
                    Dispatcher::PlatformHandle(PlatformHandleDispatcher::new(fd))
                },
            };
            dispatchers.push(dispatcher);
        }

        let route = lock(&self.routes).get(&target).cloned();
        let message = Message::new(payload, dispatchers);
        match route {
            Some(Route::Endpoint(weak)) => match weak.upgrade() {
                Some(endpoint) => endpoint.accept(message),
                None => trace!(channel = %self.id, ?target, "dropping message for closed endpoint"),
            },
            Some(Route::Forwarder(endpoint)) => endpoint.forward_to_peer(message),
            None => trace!(channel = %self.id, ?target, "dropping message for unknown pipe"),
        }
        Ok(())
    }

    fn on_remote_close(&self, key: EndpointKey) {
        let route = lock(&self.routes).remove(&key);
        match route {
            Some(Route::Endpoint(weak)) => {
                if let Some(endpoint) = weak.upgrade() {
                    endpoint.peer_closed();
                }
            },
            Some(Route::Forwarder(endpoint)) => endpoint.detach(),
            None => trace!(channel = %self.id, ?key, "close for unknown pipe"),
        }
    }

    fn tear_down_routes(&self) {
        let routes: Vec<Route> = lock(&self.routes).drain().map(|(_, r)| r).collect();
        for route in routes {
            match route {
                Route::Endpoint(weak) => {
                    if let Some(endpoint) = weak.upgrade() {
                        endpoint.peer_closed();
                    }
                },
                Route::Forwarder(endpoint) => endpoint.detach(),
            }
        }
    }

    fn notify_connected(&self) {
        if let Some(observer) = &self.observer {
            observer.on_connected(self.id);
        }
    }

    /// Handle a fatal transport or protocol error. Runs at most once.
    fn fail(&self, error: ChannelError) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = self.state();
        if error.is_peer_closed() || state != ChannelState::Running {
            debug!(channel = %self.id, error = %error, "channel closed");
        } else {
            warn!(channel = %self.id, error = %error, "channel error");
        }
        let _ = self.outbound.send(Outbound::Shutdown);
        self.tear_down_routes();

        if state == ChannelState::Destroyed {
            return;
        }
        if let Some(observer) = &self.observer {
            observer.on_error(self.id, &error);
        }
        if let Some(delegate) = &self.delegate {
            delegate.on_channel_error(self.id, &error);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn missing_fd() -> ChannelError {
    ChannelError::Protocol("attachment without a descriptor".to_owned())
}

fn transport_error(e: io::Error) -> ChannelError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => ChannelError::PeerClosed,
        _ => ChannelError::Io(e),
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn read_loop(channel: Arc<Channel>, stream: Arc<UnixStream>) {
    let mut decoder = FrameDecoder::default();
    let mut buf = vec![0u8; READ_CHUNK];
    let raw = stream.as_raw_fd();
    loop {
        if let Err(e) = stream.readable().await {
            channel.fail(transport_error(e));
            return;
        }
        let (n, fds) = match stream.try_io(Interest::READABLE, || recv_with_fds(raw, &mut buf)) {
            Ok(read) => read,
            Err(e) if is_retryable(&e) => continue,
            Err(e) => {
                channel.fail(transport_error(e));
                return;
            },
        };
        if n == 0 {
            channel.fail(ChannelError::PeerClosed);
            return;
        }
        decoder.push(&buf[..n], fds);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) = channel.handle_frame(frame) {
                        channel.fail(e);
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    channel.fail(e);
                    return;
                },
            }
        }
    }
}

async fn write_loop(
    channel: Arc<Channel>,
    stream: Arc<UnixStream>,
    mut outbound: tokio_mpsc::UnboundedReceiver<Outbound>,
    flushed: mpsc::Sender<()>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame { bytes, fds } => {
                if let Err(e) = write_frame(&stream, &bytes, fds).await {
                    channel.fail(e);
                    break;
                }
            },
            Outbound::Shutdown => break,
        }
    }
    if let Err(e) = shutdown(stream.as_raw_fd(), Shutdown::Write) {
        trace!(channel = %channel.id(), error = %e, "socket shutdown failed");
    }
    let _ = flushed.send(());
}

async fn write_frame(stream: &UnixStream, bytes: &[u8], fds: Vec<OwnedFd>) -> ChannelResult<()> {
    let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let socket = stream.as_raw_fd();
    let mut offset = 0usize;
    while let Some(rest) = bytes.get(offset..).filter(|rest| !rest.is_empty()) {
        stream.writable().await.map_err(transport_error)?;
        // Descriptors ride on the first bytes only.
        let attach: &[RawFd] = if offset == 0 { &raw_fds } else { &[] };
        match stream.try_io(Interest::WRITABLE, || send_with_fds(socket, rest, attach)) {
            Ok(n) => offset = offset.saturating_add(n),
            Err(e) if is_retryable(&e) => {},
            Err(e) => return Err(transport_error(e)),
        }
    }
    drop(fds);
    Ok(())
}
