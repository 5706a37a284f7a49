//! The child side of an out-of-process application: announce the connection
//! id over the inherited socket, wait for `StartApp`, run the code unit on the
//! main thread and report its result.
//!
//! Losing the bootstrap channel before the application finished is fatal:
//! the process logs and exits with status 1.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use switchyard_channel::{
    ChannelError, ChannelId, ChannelManager, ChannelObserver, ChannelOptions, ConnectionId,
    IoThread,
};
use switchyard_system::{Core, Handle, Signals, SystemError, SystemLimits, TaskRunner};
use tracing::{debug, error, info, warn};

use crate::code_unit::{CleanupPolicy, CodeUnitLoader};
use crate::control::ControlMessage;
use crate::error::{ShellError, ShellResult};
use crate::protocol::{read_json, write_json};

/// How long the child waits for `AppCompleted` to reach the socket.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit status used when the bootstrap channel is lost.
pub const FATAL_EXIT_CODE: i32 = 1;

/// Everything [`run_child`] needs, usually parsed from the command line.
pub struct ChildOptions {
    /// Id to announce in the handshake.
    pub connection_id: ConnectionId,
    /// The inherited end of the bootstrap socket pair.
    pub platform_fd: OwnedFd,
    /// Loads the code unit named by `StartApp`.
    pub code_loader: Arc<dyn CodeUnitLoader>,
    /// Limits for this process's core.
    pub limits: SystemLimits,
}

impl std::fmt::Debug for ChildOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildOptions")
            .field("connection_id", &self.connection_id)
            .field("platform_fd", &self.platform_fd)
            .finish_non_exhaustive()
    }
}

struct StartRequest {
    app_path: PathBuf,
    cleanup: CleanupPolicy,
    application_request: Handle,
}

fn fatal(reason: &str) -> ! {
    error!(reason, "lost connection to the shell; exiting");
    process::exit(FATAL_EXIT_CODE)
}

struct ChildObserver {
    shutting_down: Arc<AtomicBool>,
}

impl ChannelObserver for ChildObserver {
    fn on_connected(&self, id: ChannelId) {
        debug!(channel = %id, "bootstrap channel connected");
    }

    fn on_error(&self, id: ChannelId, error: &ChannelError) {
        if self.shutting_down.load(Ordering::Acquire) {
            debug!(channel = %id, error = %error, "bootstrap channel closed during shutdown");
            return;
        }
        fatal(&error.to_string());
    }
}

/// Controller-side state: everything the control pipe watcher needs.
#[derive(Clone)]
struct Controller {
    core: Arc<Core>,
    control: Handle,
    shutting_down: Arc<AtomicBool>,
    start: mpsc::Sender<StartRequest>,
}

impl Controller {
    /// Messages are handled on the controller thread, the core's deferred
    /// runner, whichever thread raised the signal.
    fn watch(self) {
        let core = Arc::clone(&self.core);
        let control = self.control;
        let controller = core.deferred_runner().clone();
        let signals = Signals::READABLE | Signals::PEER_CLOSED;
        let armed = core.async_wait(control, signals, move |result| {
            if let Err(e) = controller.post(move || self.on_signal(result)) {
                debug!(error = %e, "controller stopped; dropping control signal");
            }
        });
        if let Err(e) = armed {
            debug!(error = %e, "control pipe no longer watchable");
        }
    }

    fn on_signal(self, result: Result<(), SystemError>) {
        if result == Err(SystemError::Cancelled) {
            return;
        }
        loop {
            match read_json::<ControlMessage>(&self.core, self.control) {
                Ok((ControlMessage::StartApp { app_path, clean_app_path }, handles)) => {
                    self.on_start_app(app_path, clean_app_path, handles);
                },
                Ok((ControlMessage::ExitNow { exit_code }, handles)) => {
                    for handle in handles {
                        let _ = self.core.close(handle);
                    }
                    info!(exit_code, "exit requested by the shell");
                    process::exit(exit_code);
                },
                Ok((other, handles)) => {
                    warn!(message = ?other, "unexpected control message from the shell");
                    for handle in handles {
                        let _ = self.core.close(handle);
                    }
                },
                Err(ShellError::System(SystemError::ShouldWait)) => {
                    self.watch();
                    return;
                },
                Err(ShellError::Protocol(e)) => warn!(error = %e, "malformed control message"),
                Err(e) => {
                    if !self.shutting_down.load(Ordering::Acquire) {
                        fatal(&e.to_string());
                    }
                    return;
                },
            }
        }
    }

    fn on_start_app(&self, app_path: PathBuf, clean_app_path: bool, handles: Vec<Handle>) {
        let mut handles = handles.into_iter();
        let (Some(application_request), None) = (handles.next(), handles.next()) else {
            warn!(path = %app_path.display(), "StartApp must carry exactly one handle");
            for handle in handles {
                let _ = self.core.close(handle);
            }
            return;
        };
        let request = StartRequest {
            app_path,
            cleanup: CleanupPolicy::from_delete_flag(clean_app_path),
            application_request,
        };
        if let Err(mpsc::SendError(request)) = self.start.send(request) {
            warn!(
                path = %request.app_path.display(),
                "application already started; ignoring StartApp"
            );
            let _ = self.core.close(request.application_request);
        }
    }
}

/// Run a child process to completion and return its exit status.
///
/// Blocks the calling thread, which becomes the thread the code unit runs
/// on. Returns 0 once the result was reported to the shell.
///
/// # Errors
///
/// Returns an error if the runtime threads or the bootstrap channel cannot
/// be created.
pub fn run_child(options: ChildOptions) -> ShellResult<i32> {
    let ChildOptions {
        connection_id,
        platform_fd,
        code_loader,
        limits,
    } = options;

    let controller = TaskRunner::spawn("switchyard-child-controller")?;
    let io = IoThread::spawn("switchyard-child-io")?;
    let core = Arc::new(Core::with_task_runner(limits, controller.handle()));
    let channels = ChannelManager::new(Arc::clone(&core), io.handle());
    let shutting_down = Arc::new(AtomicBool::new(false));

    let observer = Arc::new(ChildObserver {
        shutting_down: Arc::clone(&shutting_down),
    });
    let channel_options = ChannelOptions::new()
        .announce_connection_id(connection_id)
        .with_observer(observer);
    let (_, control) = channels.create_channel(platform_fd, channel_options)?;
    info!("child bootstrapped; waiting for an application");

    // Only the first StartApp is honoured: the receiver is dropped after it.
    let (start_tx, start_rx) = mpsc::channel::<StartRequest>();
    Controller {
        core: Arc::clone(&core),
        control,
        shutting_down: Arc::clone(&shutting_down),
        start: start_tx,
    }
    .watch();

    let Ok(request) = start_rx.recv() else {
        fatal("control pipe watcher stopped");
    };
    drop(start_rx);

    if let Err(e) = write_json(&core, control, &ControlMessage::AppStarted, &[]) {
        fatal(&e.to_string());
    }
    let result = run_application(&core, &*code_loader, request);

    if let Err(e) = write_json(&core, control, &ControlMessage::AppCompleted { result }, &[]) {
        fatal(&e.to_string());
    }
    info!(result, "application completed; shutting down");

    shutting_down.store(true, Ordering::Release);
    if let Err(e) = channels.shutdown(FLUSH_TIMEOUT) {
        warn!(error = %e, "channel shutdown failed");
    }
    core.close_all();
    io.shutdown();
    controller.shutdown();
    Ok(0)
}

fn run_application(
    core: &Arc<Core>,
    code_loader: &dyn CodeUnitLoader,
    request: StartRequest,
) -> i32 {
    let StartRequest {
        app_path,
        cleanup,
        application_request,
    } = request;

    let result = match code_loader.load(&app_path) {
        Ok(unit) => {
            info!(path = %app_path.display(), "running application");
            let result = unit.run(core, application_request);
            drop(unit);
            result
        },
        Err(e) => {
            error!(path = %app_path.display(), error = %e, "failed to load application");
            e.code().as_i32()
        },
    };
    // The application may have closed or passed it already.
    let _ = core.close(application_request);
    cleanup.apply(&app_path);
    result
}
