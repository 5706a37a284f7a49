//! The [`Core`]: the handle-level API every other component uses.

use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatcher::{
    Dispatcher, Message, MessagePipeEndpoint, PlatformHandleDispatcher, SharedBufferDispatcher,
};
use crate::error::{SystemError, SystemResult};
use crate::handle::Handle;
use crate::signals::{Signals, SignalsState};
use crate::table::{DEFAULT_MAX_HANDLES, HandleTable};
use crate::task_runner::{TaskRunner, TaskRunnerHandle};
use crate::waiter::{Registration, WaiterId};

/// Resource limits enforced by a [`Core`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemLimits {
    /// Maximum number of live handles.
    pub max_handles: usize,
    /// Maximum payload size of one message.
    pub max_message_bytes: usize,
    /// Maximum number of handles attached to one message.
    pub max_message_handles: usize,
    /// Maximum size of one shared buffer.
    pub max_shared_buffer_bytes: u64,
}

impl Default for SystemLimits {
    fn default() -> Self {
        Self {
            max_handles: DEFAULT_MAX_HANDLES,
            max_message_bytes: 4_194_304,
            max_message_handles: 10_000,
            max_shared_buffer_bytes: 1_073_741_824,
        }
    }
}

/// A message read from a pipe, with its attachments already added to the table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadMessage {
    /// Payload.
    pub bytes: Vec<u8>,
    /// Handles for the attached dispatchers, in attachment order.
    pub handles: Vec<Handle>,
}

/// Result of [`Core::wait_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitManyOutcome {
    /// Index of the wait that resolved first.
    pub index: usize,
    /// How it resolved.
    pub result: SystemResult<()>,
}

/// Owns the handle table and exposes handle-level operations.
///
/// Safe to share across threads behind an `Arc`.
pub struct Core {
    table: HandleTable,
    limits: SystemLimits,
    deferred: TaskRunnerHandle,
    next_waiter: AtomicU64,
    // Declared last so the runner is joined after everything else is dropped.
    _own_runner: Option<TaskRunner>,
}

impl Core {
    /// Create a core with its own thread for deferred wait callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ResourceExhausted`] if the thread cannot be spawned.
    pub fn new(limits: SystemLimits) -> SystemResult<Self> {
        let runner = TaskRunner::spawn("switchyard-waits")?;
        let mut core = Self::with_task_runner(limits, runner.handle());
        core._own_runner = Some(runner);
        Ok(core)
    }

    /// Create a core whose deferred wait callbacks run on `deferred`.
    #[must_use]
    pub fn with_task_runner(limits: SystemLimits, deferred: TaskRunnerHandle) -> Self {
        Self {
            table: HandleTable::new(limits.max_handles),
            limits,
            deferred,
            next_waiter: AtomicU64::new(1),
            _own_runner: None,
        }
    }

    /// Limits in force.
    #[must_use]
    pub fn limits(&self) -> &SystemLimits {
        &self.limits
    }

    /// Number of live handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.table.len()
    }

    /// The runner that deferred wait callbacks are posted to.
    #[must_use]
    pub fn deferred_runner(&self) -> &TaskRunnerHandle {
        &self.deferred
    }

    /// Add a dispatcher to the table.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ResourceExhausted`] when the table is full.
    pub fn add_dispatcher(&self, dispatcher: Dispatcher) -> SystemResult<Handle> {
        self.table.add(dispatcher)
    }

    /// Look up a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for unknown handles.
    pub fn get_dispatcher(&self, handle: Handle) -> SystemResult<Dispatcher> {
        self.table.get(handle)
    }

    /// Remove a dispatcher from the table without closing it.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for unknown handles and
    /// [`SystemError::Busy`] for handles in transit.
    pub fn take_dispatcher(&self, handle: Handle) -> SystemResult<Dispatcher> {
        self.table.remove(handle)
    }

    /// Close a handle. The handle is invalid as soon as this returns.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for unknown handles and
    /// [`SystemError::Busy`] for handles in transit.
    pub fn close(&self, handle: Handle) -> SystemResult<()> {
        self.table.remove(handle)?.close();
        Ok(())
    }

    /// Close every handle in the table.
    pub fn close_all(&self) {
        let dispatchers = self.table.drain();
        if !dispatchers.is_empty() {
            debug!(count = dispatchers.len(), "closing remaining handles");
        }
        for dispatcher in dispatchers {
            dispatcher.close();
        }
    }

    /// Create a message pipe and return both ends.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ResourceExhausted`] when the table is full.
    pub fn create_message_pipe(&self) -> SystemResult<(Handle, Handle)> {
        let (a, b) = MessagePipeEndpoint::pair();
        let first = self.add_dispatcher(Dispatcher::MessagePipe(a))?;
        match self.add_dispatcher(Dispatcher::MessagePipe(b)) {
            Ok(second) => Ok((first, second)),
            Err(e) => {
                let _ = self.close(first);
                Err(e)
            },
        }
    }

    /// Write a message, transferring `handles` with it.
    ///
    /// On success the attached handles are no longer valid in this table.
    /// On failure they are untouched.
    ///
    /// # Errors
    ///
    /// - [`SystemError::InvalidArgument`]: `handle` is not a message pipe, an
    ///   attached handle is unknown or repeated, or `handle` is attached to itself.
    /// - [`SystemError::Busy`]: an attached handle is in another write.
    /// - [`SystemError::ResourceExhausted`]: the message exceeds a limit.
    /// - [`SystemError::FailedPrecondition`]: the peer has closed.
    pub fn write_message(
        &self,
        handle: Handle,
        bytes: impl Into<Vec<u8>>,
        handles: &[Handle],
    ) -> SystemResult<()> {
        let endpoint = self.message_pipe(handle)?;
        let bytes = bytes.into();
        if bytes.len() > self.limits.max_message_bytes {
            return Err(SystemError::ResourceExhausted(format!(
                "message of {} bytes exceeds limit of {}",
                bytes.len(),
                self.limits.max_message_bytes
            )));
        }
        if handles.len() > self.limits.max_message_handles {
            return Err(SystemError::ResourceExhausted(format!(
                "{} attached handles exceed limit of {}",
                handles.len(),
                self.limits.max_message_handles
            )));
        }
        if handles.contains(&handle) {
            return Err(SystemError::invalid("a pipe cannot be attached to itself"));
        }
        let mut seen = HashSet::with_capacity(handles.len());
        if !handles.iter().all(|h| seen.insert(*h)) {
            return Err(SystemError::invalid("handle attached more than once"));
        }

        let dispatchers = self.table.begin_transit(handles)?;
        match endpoint.write(Message::new(bytes, dispatchers)) {
            Ok(()) => {
                self.table.complete_transit(handles);
                Ok(())
            },
            Err(e) => {
                self.table.cancel_transit(handles);
                Err(e)
            },
        }
    }

    /// Read the oldest message on a pipe.
    ///
    /// # Errors
    ///
    /// - [`SystemError::ShouldWait`]: nothing queued yet.
    /// - [`SystemError::FailedPrecondition`]: nothing queued and the peer closed.
    /// - [`SystemError::ResourceExhausted`]: the attachments did not fit in
    ///   the table; the message is discarded.
    pub fn read_message(&self, handle: Handle) -> SystemResult<ReadMessage> {
        let Message { bytes, dispatchers } = self.message_pipe(handle)?.read()?;
        let mut handles = Vec::with_capacity(dispatchers.len());
        let mut rest = dispatchers.into_iter();
        for dispatcher in rest.by_ref() {
            match self.table.add(dispatcher) {
                Ok(h) => handles.push(h),
                Err(e) => {
                    for h in handles {
                        let _ = self.close(h);
                    }
                    for d in rest {
                        d.close();
                    }
                    return Err(e);
                },
            }
        }
        Ok(ReadMessage { bytes, handles })
    }

    /// Byte and handle counts of the next message without consuming it.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Core::read_message`].
    pub fn peek_message_size(&self, handle: Handle) -> SystemResult<(usize, usize)> {
        self.message_pipe(handle)?.peek_sizes()
    }

    /// Allocate a shared buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ResourceExhausted`] above the configured size
    /// limit and [`SystemError::InvalidArgument`] for an empty buffer.
    pub fn create_shared_buffer(&self, num_bytes: u64) -> SystemResult<Handle> {
        if num_bytes > self.limits.max_shared_buffer_bytes {
            return Err(SystemError::ResourceExhausted(format!(
                "shared buffer of {num_bytes} bytes exceeds limit of {}",
                self.limits.max_shared_buffer_bytes
            )));
        }
        let buffer = SharedBufferDispatcher::create(num_bytes)?;
        self.add_dispatcher(Dispatcher::SharedBuffer(buffer))
    }

    /// The shared buffer behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for unknown handles or other kinds.
    pub fn shared_buffer(&self, handle: Handle) -> SystemResult<SharedBufferDispatcher> {
        match self.table.get(handle)? {
            Dispatcher::SharedBuffer(buffer) => Ok(buffer),
            other => Err(wrong_kind(handle, &other, "shared buffer")),
        }
    }

    /// Create a second handle to the same shared buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for unknown handles or other
    /// kinds, and [`SystemError::ResourceExhausted`] when the table is full.
    pub fn duplicate_buffer(&self, handle: Handle) -> SystemResult<Handle> {
        let duplicate = self.shared_buffer(handle)?.duplicate()?;
        self.add_dispatcher(Dispatcher::SharedBuffer(duplicate))
    }

    /// Wrap an OS descriptor in a handle.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ResourceExhausted`] when the table is full.
    pub fn wrap_platform_handle(&self, fd: OwnedFd) -> SystemResult<Handle> {
        self.add_dispatcher(Dispatcher::PlatformHandle(PlatformHandleDispatcher::new(fd)))
    }

    /// Unwrap a platform handle, consuming the handle.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] if `handle` is unknown or not
    /// a platform handle.
    pub fn pass_wrapped_platform_handle(&self, handle: Handle) -> SystemResult<OwnedFd> {
        let dispatcher = self.table.get(handle)?;
        if !matches!(dispatcher, Dispatcher::PlatformHandle(_)) {
            return Err(wrong_kind(handle, &dispatcher, "platform handle"));
        }
        // The descriptor stays wrapped unless the handle is really gone.
        match self.table.remove(handle)? {
            Dispatcher::PlatformHandle(platform) => platform.take(),
            other => Err(wrong_kind(handle, &other, "platform handle")),
        }
    }

    /// Register a one-shot callback for when any of `signals` is satisfied
    /// on `handle`, or becomes unsatisfiable.
    ///
    /// The callback never runs inside this call. If the outcome is already
    /// known it is posted to the deferred runner; otherwise it runs on the
    /// thread that observes the transition, outside any endpoint lock.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for unknown handles and
    /// [`SystemError::FailedPrecondition`] if the deferred runner has stopped.
    pub fn async_wait(
        &self,
        handle: Handle,
        signals: Signals,
        callback: impl FnOnce(SystemResult<()>) + Send + 'static,
    ) -> SystemResult<WaiterId> {
        let dispatcher = self.table.get(handle)?;
        let id = self.next_waiter_id();
        if let Registration::Ready(ready) = dispatcher.add_waiter(id, signals, Box::new(callback)) {
            self.deferred.post(move || ready.fire())?;
        }
        Ok(id)
    }

    /// Unregister a waiter that has not fired yet.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for unknown handles.
    pub fn cancel_wait(&self, handle: Handle, id: WaiterId) -> SystemResult<bool> {
        Ok(self.table.get(handle)?.remove_waiter(id))
    }

    /// Block until any of `signals` is satisfied on `handle`.
    ///
    /// # Errors
    ///
    /// - [`SystemError::FailedPrecondition`]: the signals can never be satisfied.
    /// - [`SystemError::DeadlineExceeded`]: `deadline` elapsed first.
    /// - [`SystemError::Cancelled`]: the handle was closed while waiting.
    pub fn wait(
        &self,
        handle: Handle,
        signals: Signals,
        deadline: Option<Duration>,
    ) -> SystemResult<SignalsState> {
        self.wait_many(&[(handle, signals)], deadline)?.result?;
        Ok(self
            .table
            .get(handle)
            .map(|d| d.signals_state())
            .unwrap_or_default())
    }

    /// Block until the first of several waits resolves.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for an empty list or unknown
    /// handles, and [`SystemError::DeadlineExceeded`] on timeout.
    pub fn wait_many(
        &self,
        waits: &[(Handle, Signals)],
        deadline: Option<Duration>,
    ) -> SystemResult<WaitManyOutcome> {
        if waits.is_empty() {
            return Err(SystemError::invalid("nothing to wait for"));
        }
        let dispatchers = waits
            .iter()
            .map(|(h, _)| self.table.get(*h))
            .collect::<SystemResult<Vec<_>>>()?;

        let (tx, rx) = mpsc::channel();
        let mut registered = Vec::with_capacity(waits.len());
        for (index, (dispatcher, (_, signals))) in dispatchers.iter().zip(waits).enumerate() {
            let id = self.next_waiter_id();
            let tx = tx.clone();
            let callback = Box::new(move |result| {
                let _ = tx.send(WaitManyOutcome { index, result });
            });
            match dispatcher.add_waiter(id, *signals, callback) {
                Registration::Pending => registered.push((dispatcher, id)),
                Registration::Ready(ready) => {
                    // Blocking waits resolve inline; only async callbacks are deferred.
                    ready.fire();
                    break;
                },
            }
        }
        drop(tx);

        let outcome = match deadline {
            None => rx.recv().map_err(|_| SystemError::Cancelled),
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => SystemError::DeadlineExceeded,
                mpsc::RecvTimeoutError::Disconnected => SystemError::Cancelled,
            }),
        };
        for (dispatcher, id) in registered {
            dispatcher.remove_waiter(id);
        }
        outcome
    }

    fn message_pipe(&self, handle: Handle) -> SystemResult<MessagePipeEndpoint> {
        match self.table.get(handle)? {
            Dispatcher::MessagePipe(endpoint) => Ok(endpoint),
            other => Err(wrong_kind(handle, &other, "message pipe")),
        }
    }

    fn next_waiter_id(&self) -> WaiterId {
        WaiterId(self.next_waiter.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let remaining = self.table.len();
        if remaining > 0 {
            warn!(count = remaining, "core dropped with open handles");
            self.close_all();
        }
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("table", &self.table)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

fn wrong_kind(handle: Handle, dispatcher: &Dispatcher, expected: &str) -> SystemError {
    SystemError::invalid(format!(
        "handle {handle} is a {}, not a {expected}",
        dispatcher.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn core() -> Core {
        Core::new(SystemLimits::default()).unwrap()
    }

    #[test]
    fn test_handle_valid_until_close() {
        let core = core();
        let (a, b) = core.create_message_pipe().unwrap();
        assert!(core.get_dispatcher(a).is_ok());
        core.close(a).unwrap();
        assert!(matches!(
            core.get_dispatcher(a),
            Err(SystemError::InvalidArgument(_))
        ));
        assert!(matches!(core.close(a), Err(SystemError::InvalidArgument(_))));
        assert!(core.get_dispatcher(b).is_ok());
    }

    #[test]
    fn test_write_read_round_trip() {
        let core = core();
        let (a, b) = core.create_message_pipe().unwrap();
        core.write_message(a, b"hello".to_vec(), &[]).unwrap();
        core.write_message(a, b"world".to_vec(), &[]).unwrap();
        assert_eq!(core.peek_message_size(b).unwrap(), (5, 0));
        assert_eq!(core.read_message(b).unwrap().bytes, b"hello");
        assert_eq!(core.read_message(b).unwrap().bytes, b"world");
        assert_eq!(core.read_message(b).unwrap_err(), SystemError::ShouldWait);
    }

    #[test]
    fn test_transfer_handle_through_pipe() {
        let core = core();
        let (a, b) = core.create_message_pipe().unwrap();
        let (c, d) = core.create_message_pipe().unwrap();

        core.write_message(a, b"take this".to_vec(), &[d]).unwrap();
        assert!(core.get_dispatcher(d).is_err());

        let received = core.read_message(b).unwrap();
        assert_eq!(received.handles.len(), 1);
        let d2 = received.handles[0];
        core.write_message(c, b"via transferred end".to_vec(), &[]).unwrap();
        assert_eq!(core.read_message(d2).unwrap().bytes, b"via transferred end");
    }

    #[test]
    fn test_write_rejects_self_and_duplicates() {
        let core = core();
        let (a, _b) = core.create_message_pipe().unwrap();
        let (c, _d) = core.create_message_pipe().unwrap();
        assert!(matches!(
            core.write_message(a, Vec::new(), &[a]),
            Err(SystemError::InvalidArgument(_))
        ));
        assert!(matches!(
            core.write_message(a, Vec::new(), &[c, c]),
            Err(SystemError::InvalidArgument(_))
        ));
        assert!(core.get_dispatcher(c).is_ok());
    }

    #[test]
    fn test_failed_write_keeps_attachments() {
        let core = core();
        let (a, b) = core.create_message_pipe().unwrap();
        let (c, _d) = core.create_message_pipe().unwrap();
        core.close(b).unwrap();
        assert!(matches!(
            core.write_message(a, b"x".to_vec(), &[c]),
            Err(SystemError::FailedPrecondition(_))
        ));
        assert!(core.get_dispatcher(c).is_ok());
    }

    #[test]
    fn test_message_limits() {
        let limits = SystemLimits {
            max_message_bytes: 4,
            max_message_handles: 1,
            ..SystemLimits::default()
        };
        let core = Core::new(limits).unwrap();
        let (a, _b) = core.create_message_pipe().unwrap();
        let (c, d) = core.create_message_pipe().unwrap();
        assert!(matches!(
            core.write_message(a, b"too long".to_vec(), &[]),
            Err(SystemError::ResourceExhausted(_))
        ));
        assert!(matches!(
            core.write_message(a, Vec::new(), &[c, d]),
            Err(SystemError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_table_full() {
        let limits = SystemLimits {
            max_handles: 3,
            ..SystemLimits::default()
        };
        let core = Core::new(limits).unwrap();
        core.create_message_pipe().unwrap();
        core.create_shared_buffer(8).unwrap();
        assert!(matches!(
            core.create_message_pipe(),
            Err(SystemError::ResourceExhausted(_))
        ));
        assert_eq!(core.handle_count(), 3);
    }

    #[test]
    fn test_shared_buffer_ops() {
        let core = core();
        let h = core.create_shared_buffer(32).unwrap();
        let dup = core.duplicate_buffer(h).unwrap();
        core.shared_buffer(h).unwrap().write_at(0, b"abc").unwrap();
        assert_eq!(core.shared_buffer(dup).unwrap().read_at(0, 3).unwrap(), b"abc");

        let (pipe, _) = core.create_message_pipe().unwrap();
        assert!(matches!(
            core.shared_buffer(pipe),
            Err(SystemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_shared_buffer_limit() {
        let limits = SystemLimits {
            max_shared_buffer_bytes: 16,
            ..SystemLimits::default()
        };
        let core = Core::new(limits).unwrap();
        assert!(matches!(
            core.create_shared_buffer(17),
            Err(SystemError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_platform_handle_kind_mismatch() {
        let core = core();
        let fd = OwnedFd::from(tempfile::tempfile().unwrap());
        let h = core.wrap_platform_handle(fd).unwrap();
        let (pipe, _) = core.create_message_pipe().unwrap();

        assert!(matches!(
            core.pass_wrapped_platform_handle(pipe),
            Err(SystemError::InvalidArgument(_))
        ));
        assert!(core.get_dispatcher(pipe).is_ok());

        core.pass_wrapped_platform_handle(h).unwrap();
        assert!(core.get_dispatcher(h).is_err());
    }

    #[test]
    fn test_pass_platform_handle_in_transit_keeps_descriptor() {
        let core = core();
        let fd = OwnedFd::from(tempfile::tempfile().unwrap());
        let h = core.wrap_platform_handle(fd).unwrap();

        core.table.begin_transit(&[h]).unwrap();
        assert_eq!(core.pass_wrapped_platform_handle(h).unwrap_err(), SystemError::Busy);
        core.table.cancel_transit(&[h]);

        let Dispatcher::PlatformHandle(platform) = core.get_dispatcher(h).unwrap() else {
            panic!("kind changed");
        };
        assert!(platform.raw_fd().is_some());
        core.pass_wrapped_platform_handle(h).unwrap();
        assert!(core.get_dispatcher(h).is_err());
    }

    #[test]
    fn test_async_wait_is_deferred() {
        let core = core();
        let (a, b) = core.create_message_pipe().unwrap();
        core.write_message(a, b"ready".to_vec(), &[]).unwrap();

        let fired_on = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        {
            let fired_on = Arc::clone(&fired_on);
            core.async_wait(b, Signals::READABLE, move |result| {
                *fired_on.lock().unwrap() = Some(std::thread::current().id());
                tx.send(result).unwrap();
            })
            .unwrap();
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        assert_ne!(fired_on.lock().unwrap().unwrap(), caller);
    }

    #[test]
    fn test_async_wait_fires_on_write_from_other_thread() {
        let core = Arc::new(core());
        let (a, b) = core.create_message_pipe().unwrap();
        let (tx, rx) = mpsc::channel();
        core.async_wait(b, Signals::READABLE, move |r| tx.send(r).unwrap())
            .unwrap();

        let writer = {
            let core = Arc::clone(&core);
            std::thread::spawn(move || core.write_message(a, b"ping".to_vec(), &[]).unwrap())
        };
        writer.join().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
    }

    #[test]
    fn test_async_wait_callback_can_reenter_core() {
        let core = Arc::new(core());
        let (a, b) = core.create_message_pipe().unwrap();
        let (tx, rx) = mpsc::channel();
        {
            let core2 = Arc::clone(&core);
            core.async_wait(b, Signals::READABLE, move |_| {
                let msg = core2.read_message(b).unwrap();
                core2.write_message(b, msg.bytes, &[]).unwrap();
                tx.send(()).unwrap();
            })
            .unwrap();
        }
        core.write_message(a, b"echo".to_vec(), &[]).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(core.read_message(a).unwrap().bytes, b"echo");
    }

    #[test]
    fn test_close_cancels_waiters() {
        let core = core();
        let (_a, b) = core.create_message_pipe().unwrap();
        let (tx, rx) = mpsc::channel();
        core.async_wait(b, Signals::READABLE, move |r| tx.send(r).unwrap())
            .unwrap();
        core.close(b).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(SystemError::Cancelled)
        );
    }

    #[test]
    fn test_peer_close_makes_readable_unsatisfiable() {
        let core = core();
        let (a, b) = core.create_message_pipe().unwrap();
        let (tx, rx) = mpsc::channel();
        core.async_wait(b, Signals::READABLE, move |r| tx.send(r).unwrap())
            .unwrap();
        core.close(a).unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(SystemError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn test_blocking_wait() {
        let core = Arc::new(core());
        let (a, b) = core.create_message_pipe().unwrap();
        assert_eq!(
            core.wait(b, Signals::READABLE, Some(Duration::from_millis(20)))
                .unwrap_err(),
            SystemError::DeadlineExceeded
        );

        let writer = {
            let core = Arc::clone(&core);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                core.write_message(a, b"late".to_vec(), &[]).unwrap();
            })
        };
        let state = core.wait(b, Signals::READABLE, None).unwrap();
        assert!(state.satisfied.contains(Signals::READABLE));
        writer.join().unwrap();
    }

    #[test]
    fn test_wait_many_reports_index() {
        let core = core();
        let (a, b) = core.create_message_pipe().unwrap();
        let (_c, d) = core.create_message_pipe().unwrap();
        core.write_message(a, b"x".to_vec(), &[]).unwrap();
        let outcome = core
            .wait_many(
                &[(d, Signals::READABLE), (b, Signals::READABLE)],
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(outcome, WaitManyOutcome {
            index: 1,
            result: Ok(())
        });
    }

    #[test]
    fn test_close_all() {
        let core = core();
        let (a, _b) = core.create_message_pipe().unwrap();
        core.create_shared_buffer(4).unwrap();
        core.close_all();
        assert_eq!(core.handle_count(), 0);
        assert!(core.get_dispatcher(a).is_err());
    }
}
