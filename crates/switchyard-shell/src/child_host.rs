//! Launches and supervises one child process over a bootstrap channel.
//!
//! The host creates a socket pair, spawns the child on a launcher thread
//! with one end inherited, and binds the other end to a channel that only
//! accepts traffic after the child announces the per-launch connection id.
//! The channel's primary pipe carries the control protocol.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use switchyard_channel::{
    ChannelError, ChannelId, ChannelManager, ChannelObserver, ChannelOptions, ConnectionId,
    PlatformChannelPair,
};
use switchyard_system::{Core, Handle, ResultCode, Signals, SystemError, SystemLimits};
use tracing::{debug, error, info, warn};

use crate::code_unit::CleanupPolicy;
use crate::completion::AppCompletion;
use crate::control::ControlMessage;
use crate::error::{ShellError, ShellResult};
use crate::protocol::{read_json, write_json};

/// How long [`ChildProcessHost::join`] waits, after the child exited, for
/// its last control messages to be processed.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code reported by [`ChildProcessHost::join`] when no process ran.
pub const NO_PROCESS_EXIT_CODE: i32 = -1;

/// Everything a host needs to launch children.
#[derive(Clone)]
pub struct ChildProcessOptions {
    /// Core the control pipe lives in.
    pub core: Arc<Core>,
    /// Manager owning the bootstrap channels.
    pub channels: ChannelManager,
    /// Path of the `switchyard-child` binary.
    pub child_path: PathBuf,
    /// Log level forwarded to the child.
    pub log_level: Option<String>,
    /// Limits forwarded to the child's core.
    pub limits: SystemLimits,
}

/// Command-line switches carrying `limits` to a child.
#[must_use]
pub fn limit_switches(limits: &SystemLimits) -> [String; 4] {
    [
        format!("--max-handles={}", limits.max_handles),
        format!("--max-message-bytes={}", limits.max_message_bytes),
        format!("--max-message-handles={}", limits.max_message_handles),
        format!("--max-shared-buffer-bytes={}", limits.max_shared_buffer_bytes),
    ]
}

impl std::fmt::Debug for ChildProcessOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessOptions")
            .field("child_path", &self.child_path)
            .field("log_level", &self.log_level)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Why a child reached [`ChildState::Completed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The process could not be spawned.
    LaunchFailure,
    /// The application returned this result.
    AppCompleted(i32),
    /// The bootstrap connection went away first.
    ConnectionLost,
}

impl CompletionReason {
    /// The result code reported to the completion.
    #[must_use]
    pub fn result_code(self) -> i32 {
        match self {
            Self::LaunchFailure => ResultCode::Unavailable.as_i32(),
            Self::AppCompleted(result) => result,
            Self::ConnectionLost => ResultCode::Unknown.as_i32(),
        }
    }
}

/// Lifecycle of a [`ChildProcessHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// `start` has not been called.
    Idle,
    /// Spawn requested, handshake not yet seen.
    Launching,
    /// The child announced the right connection id.
    BootstrapConnected,
    /// The child acknowledged `StartApp`.
    Running,
    /// Terminal.
    Completed(CompletionReason),
}

impl ChildState {
    /// Whether the state is terminal.
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed(_))
    }

    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Launching => 1,
            Self::BootstrapConnected => 2,
            Self::Running => 3,
            Self::Completed(_) => 4,
        }
    }
}

struct Status {
    state: ChildState,
    completion: Option<AppCompletion>,
}

/// State shared with the launcher thread, the channel observer and the
/// control pipe watcher.
struct Shared {
    status: Mutex<Status>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ChildState {
        self.lock().state
    }

    /// Move forward to `next`; never backwards and never out of `Completed`.
    fn advance(&self, next: ChildState) {
        let mut status = self.lock();
        if next.rank() > status.state.rank() && !next.is_completed() {
            debug!(from = ?status.state, to = ?next, "child state");
            status.state = next;
            self.changed.notify_all();
        }
    }

    /// Enter `Completed(reason)` and fire the completion, once.
    fn complete(&self, reason: CompletionReason) {
        let completion = {
            let mut status = self.lock();
            if status.state.is_completed() {
                return;
            }
            debug!(from = ?status.state, reason = ?reason, "child completed");
            status.state = ChildState::Completed(reason);
            self.changed.notify_all();
            status.completion.take()
        };
        if let Some(completion) = completion {
            completion.complete(reason.result_code());
        }
    }

    /// Store `completion`, or fire it now if the child already completed.
    fn set_completion(&self, completion: AppCompletion) {
        let mut status = self.lock();
        if let ChildState::Completed(reason) = status.state {
            drop(status);
            completion.complete(reason.result_code());
            return;
        }
        status.completion = Some(completion);
    }

    fn wait_completed(&self, timeout: Duration) -> Option<CompletionReason> {
        let status = self.lock();
        let (status, _) = self
            .changed
            .wait_timeout_while(status, timeout, |s| !s.state.is_completed())
            .unwrap_or_else(PoisonError::into_inner);
        match status.state {
            ChildState::Completed(reason) => Some(reason),
            _ => None,
        }
    }
}

struct HostObserver {
    shared: Weak<Shared>,
}

impl ChannelObserver for HostObserver {
    fn on_connected(&self, id: ChannelId) {
        debug!(channel = %id, "child bootstrap connected");
        if let Some(shared) = self.shared.upgrade() {
            shared.advance(ChildState::BootstrapConnected);
        }
    }

    fn on_error(&self, id: ChannelId, error: &ChannelError) {
        // Completion is driven by the control pipe, which still holds any
        // messages that arrived before the failure.
        debug!(channel = %id, error = %error, "child bootstrap channel closed");
    }
}

/// Watch the control pipe until the child completes or disconnects.
fn watch_control(core: &Arc<Core>, pipe: Handle, shared: &Arc<Shared>) {
    let watcher_core = Arc::clone(core);
    let watcher_shared = Arc::clone(shared);
    let armed = core.async_wait(pipe, Signals::READABLE | Signals::PEER_CLOSED, move |result| {
        on_control_signal(&watcher_core, pipe, &watcher_shared, result);
    });
    if let Err(e) = armed {
        debug!(error = %e, "control pipe gone");
        shared.complete(CompletionReason::ConnectionLost);
    }
}

fn on_control_signal(
    core: &Arc<Core>,
    pipe: Handle,
    shared: &Arc<Shared>,
    result: Result<(), SystemError>,
) {
    if result == Err(SystemError::Cancelled) {
        shared.complete(CompletionReason::ConnectionLost);
        return;
    }
    loop {
        match read_json::<ControlMessage>(core, pipe) {
            Ok((ControlMessage::AppStarted, _)) => shared.advance(ChildState::Running),
            Ok((ControlMessage::AppCompleted { result }, _)) => {
                info!(result, "child application completed");
                shared.complete(CompletionReason::AppCompleted(result));
            },
            Ok((other, handles)) => {
                warn!(message = ?other, "unexpected control message from child");
                for handle in handles {
                    let _ = core.close(handle);
                }
            },
            Err(ShellError::System(SystemError::ShouldWait)) => {
                watch_control(core, pipe, shared);
                return;
            },
            Err(ShellError::Protocol(e)) => warn!(error = %e, "malformed control message"),
            Err(e) => {
                debug!(error = %e, "control pipe closed");
                shared.complete(CompletionReason::ConnectionLost);
                return;
            },
        }
    }
}

/// One child process and its bootstrap channel.
///
/// Dropping the host tears the channel down, which makes the child exit,
/// and reaps the process, waiting for an in-flight launch first.
pub struct ChildProcessHost {
    options: ChildProcessOptions,
    shared: Arc<Shared>,
    channel: Option<ChannelId>,
    control: Option<Handle>,
    launcher: Option<JoinHandle<Option<Child>>>,
    exit_code: Option<i32>,
    app_requested: bool,
}

impl ChildProcessHost {
    /// A host that has not launched anything yet.
    #[must_use]
    pub fn new(options: ChildProcessOptions) -> Self {
        Self {
            options,
            shared: Arc::new(Shared {
                status: Mutex::new(Status {
                    state: ChildState::Idle,
                    completion: None,
                }),
                changed: Condvar::new(),
            }),
            channel: None,
            control: None,
            launcher: None,
            exit_code: None,
            app_requested: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ChildState {
        self.shared.state()
    }

    /// Create the bootstrap channel and spawn the child on a launcher
    /// thread. A spawn failure is reported as
    /// [`CompletionReason::LaunchFailure`], not as an error here.
    ///
    /// # Errors
    ///
    /// Returns an error if the host was already started, or if the socket
    /// pair, channel or launcher thread cannot be created.
    pub fn start(&mut self) -> ShellResult<()> {
        if self.state() != ChildState::Idle {
            return Err(
                SystemError::FailedPrecondition("child host already started".to_owned()).into(),
            );
        }
        self.shared.advance(ChildState::Launching);

        let result = self.launch();
        if result.is_err() {
            self.shared.complete(CompletionReason::LaunchFailure);
        }
        result
    }

    fn launch(&mut self) -> ShellResult<()> {
        let pair = PlatformChannelPair::new()?;
        let connection_id = ConnectionId::generate();

        let mut command = Command::new(&self.options.child_path);
        command.arg(connection_id.to_switch());
        let fd_switch = pair.prepare_to_pass(&mut command);
        command.arg(fd_switch);
        if let Some(level) = &self.options.log_level {
            command.arg(format!("--log-level={level}"));
        }
        command.args(limit_switches(&self.options.limits));
        let (local, remote) = pair.into_parts();

        let observer = Arc::new(HostObserver {
            shared: Arc::downgrade(&self.shared),
        });
        let options = ChannelOptions::new()
            .expect_connection_id(connection_id)
            .with_observer(observer);
        let (channel, control) = self.options.channels.create_channel(local, options)?;
        self.channel = Some(channel);
        self.control = Some(control);
        watch_control(&self.options.core, control, &self.shared);

        let shared = Arc::clone(&self.shared);
        let child_path = self.options.child_path.clone();
        let launcher = thread::Builder::new()
            .name("switchyard-launcher".to_owned())
            .spawn(move || {
                let child = match command.spawn() {
                    Ok(child) => {
                        info!(
                            pid = child.id(),
                            path = %child_path.display(),
                            "child process launched"
                        );
                        Some(child)
                    },
                    Err(e) => {
                        error!(
                            path = %child_path.display(),
                            error = %e,
                            "failed to launch child process"
                        );
                        shared.complete(CompletionReason::LaunchFailure);
                        None
                    },
                };
                // The child holds its own copy now.
                drop(remote);
                child
            })
            .map_err(|e| ShellError::Thread(format!("failed to spawn launcher: {e}")))?;
        self.launcher = Some(launcher);
        debug!(channel = %channel, "child launch requested");
        Ok(())
    }

    /// Ask the child to run the code unit at `app_path`. `completion` fires
    /// exactly once: with the application's result, with
    /// [`ResultCode::Unavailable`] if the launch failed, or with
    /// [`ResultCode::Unknown`] if the connection is lost.
    pub fn start_app(
        &mut self,
        app_path: &Path,
        cleanup: CleanupPolicy,
        application_request: Handle,
        completion: AppCompletion,
    ) {
        let core = &self.options.core;
        let control = match self.control {
            Some(control) if !self.app_requested => control,
            _ => {
                warn!(path = %app_path.display(), "start_app without a fresh started host");
                let _ = core.close(application_request);
                completion.complete_with(ResultCode::FailedPrecondition);
                return;
            },
        };
        self.app_requested = true;
        self.shared.set_completion(completion);

        let message = ControlMessage::StartApp {
            app_path: app_path.to_path_buf(),
            clean_app_path: cleanup.deletes(),
        };
        if let Err(e) = write_json(core, control, &message, &[application_request]) {
            debug!(error = %e, "StartApp not delivered");
            let _ = core.close(application_request);
        }
    }

    /// Ask the child to exit with `exit_code`. Fire and forget.
    pub fn exit_now(&self, exit_code: i32) {
        let Some(control) = self.control else {
            return;
        };
        let message = ControlMessage::ExitNow { exit_code };
        if let Err(e) = write_json(&self.options.core, control, &message, &[]) {
            debug!(exit_code, error = %e, "ExitNow not delivered");
        }
    }

    /// Wait for the application's result without blocking on the process.
    #[must_use]
    pub fn wait_for_completion(&self, timeout: Duration) -> Option<CompletionReason> {
        self.shared.wait_completed(timeout)
    }

    /// Block until the child process exits and return its exit code, or
    /// [`NO_PROCESS_EXIT_CODE`] if none was spawned. Tears down the
    /// bootstrap channel afterwards.
    ///
    /// Call only after [`ChildProcessHost::start`]. Waits for an in-flight
    /// launch to resolve first.
    pub fn join(&mut self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        let code = match self.take_child() {
            Some(mut child) => match child.wait() {
                Ok(status) => status.code().unwrap_or(NO_PROCESS_EXIT_CODE),
                Err(e) => {
                    warn!(error = %e, "failed to wait for child process");
                    NO_PROCESS_EXIT_CODE
                },
            },
            None => NO_PROCESS_EXIT_CODE,
        };
        // Let the IO thread deliver whatever the child sent before exiting.
        if self.shared.wait_completed(SETTLE_TIMEOUT).is_none() {
            debug!("child exited without completing");
        }
        self.tear_down();
        info!(exit_code = code, "child process joined");
        self.exit_code = Some(code);
        code
    }

    fn take_child(&mut self) -> Option<Child> {
        let launcher = self.launcher.take()?;
        launcher.join().unwrap_or_else(|_| {
            error!("launcher thread panicked");
            None
        })
    }

    fn tear_down(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = self.options.core.close(control);
        }
        if let Some(channel) = self.channel.take() {
            if let Err(e) = self.options.channels.post_destroy_channel(channel) {
                debug!(channel = %channel, error = %e, "bootstrap channel already gone");
            }
        }
        // Nothing can complete the child any more.
        self.shared.complete(CompletionReason::ConnectionLost);
    }
}

impl Drop for ChildProcessHost {
    fn drop(&mut self) {
        if self.exit_code.is_some() {
            return;
        }
        // Losing the bootstrap channel makes the child exit.
        self.tear_down();
        if let Some(mut child) = self.take_child() {
            match child.wait() {
                Ok(status) => debug!(status = %status, "child process reaped"),
                Err(e) => warn!(error = %e, "failed to reap child process"),
            }
        }
    }
}

impl std::fmt::Debug for ChildProcessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessHost")
            .field("state", &self.state())
            .field("channel", &self.channel)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn shared() -> Arc<Shared> {
        Arc::new(Shared {
            status: Mutex::new(Status {
                state: ChildState::Idle,
                completion: None,
            }),
            changed: Condvar::new(),
        })
    }

    #[test]
    fn test_state_only_moves_forward() {
        let s = shared();
        s.advance(ChildState::Running);
        s.advance(ChildState::BootstrapConnected);
        assert_eq!(s.state(), ChildState::Running);
        s.complete(CompletionReason::ConnectionLost);
        s.advance(ChildState::Running);
        s.complete(CompletionReason::AppCompleted(0));
        assert_eq!(s.state(), ChildState::Completed(CompletionReason::ConnectionLost));
    }

    #[test]
    fn test_completion_fires_once() {
        let s = shared();
        let (tx, rx) = mpsc::channel();
        s.set_completion(AppCompletion::new(move |r| tx.send(r).unwrap()));
        s.complete(CompletionReason::AppCompleted(3));
        s.complete(CompletionReason::ConnectionLost);
        assert_eq!(rx.recv().unwrap(), 3);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_limit_switches_render_every_limit() {
        let limits = SystemLimits {
            max_handles: 7,
            max_message_bytes: 64,
            max_message_handles: 2,
            max_shared_buffer_bytes: 4096,
        };
        assert_eq!(
            limit_switches(&limits),
            [
                "--max-handles=7",
                "--max-message-bytes=64",
                "--max-message-handles=2",
                "--max-shared-buffer-bytes=4096",
            ]
        );
    }

    #[test]
    fn test_late_completion_fires_immediately() {
        let s = shared();
        s.complete(CompletionReason::LaunchFailure);
        let (tx, rx) = mpsc::channel();
        s.set_completion(AppCompletion::new(move |r| tx.send(r).unwrap()));
        assert_eq!(rx.recv().unwrap(), ResultCode::Unavailable.as_i32());
        assert_eq!(s.wait_completed(Duration::ZERO), Some(CompletionReason::LaunchFailure));
    }
}
