//! [`ShellContext`]: owns the threads, the core and the application manager
//! of a shell process, and runs its event loop.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use switchyard_channel::{ChannelDelegate, ChannelError, ChannelId, ChannelManager, IoThread};
use switchyard_config::{Config, SystemSection};
use switchyard_system::{Core, Handle, SystemLimits, TaskRunner};
use tracing::{debug, info, warn};

use crate::app_url::AppUrl;
use crate::child_host::ChildProcessOptions;
use crate::code_unit::CodeUnitLoader;
use crate::error::ShellResult;
use crate::events::{ShellEvent, ShellEventQueue, ShellEventSender};
use crate::manager::ApplicationManager;
use crate::native_library::NativeLibraryLoader;
use crate::native_loader::NativeApplicationLoader;
use crate::protocol::ServicePipes;
use crate::resolver::UrlResolver;
use crate::runner::NativeRunnerFactory;

/// File name of the child binary, looked up next to the running executable.
pub const CHILD_BINARY_NAME: &str = "switchyard-child";

const CHANNEL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Core limits taken from the `[system]` section.
#[must_use]
pub fn limits_from_config(system: &SystemSection) -> SystemLimits {
    SystemLimits {
        max_handles: system.max_handles,
        max_message_bytes: system.max_message_bytes,
        max_message_handles: system.max_message_handles,
        max_shared_buffer_bytes: system.max_shared_buffer_bytes,
    }
}

/// `switchyard-child` next to the running executable.
///
/// # Errors
///
/// Returns [`ShellError::Io`](crate::ShellError::Io) if the executable path is unknown.
pub fn default_child_path() -> ShellResult<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().map_or_else(PathBuf::new, std::path::Path::to_path_buf);
    Ok(dir.join(CHILD_BINARY_NAME))
}

/// The level and directives a child should log with, as one filter string.
fn child_log_filter(config: &Config) -> String {
    std::iter::once(config.logging.level.as_str())
        .chain(config.logging.directives.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(",")
}

/// Forwards channel failures to the shell thread.
struct ShellChannelDelegate {
    events: ShellEventSender,
}

impl ChannelDelegate for ShellChannelDelegate {
    fn on_channel_error(&self, id: ChannelId, error: &ChannelError) {
        let message = error.to_string();
        let peer_closed = error.is_peer_closed();
        self.events.post(move || {
            if peer_closed {
                debug!(channel = %id, "channel peer closed");
            } else {
                warn!(channel = %id, error = %message, "channel failed");
            }
        });
    }
}

/// A shell process: threads, core, channels and the application manager.
///
/// All methods run on the thread that owns the context, the shell thread.
/// Dropping the context shuts everything down.
pub struct ShellContext {
    core: Arc<Core>,
    channels: ChannelManager,
    manager: ApplicationManager,
    native_loader: Option<Arc<NativeApplicationLoader>>,
    events: ShellEventSender,
    queue: ShellEventQueue,
    pending: BTreeSet<AppUrl>,
    quit: bool,
    io: Option<IoThread>,
    controller: Option<TaskRunner>,
}

impl ShellContext {
    /// Start the controller and IO threads and create an empty manager whose
    /// origin is the executable's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned or the executable path
    /// is unknown.
    pub fn new(limits: SystemLimits) -> ShellResult<Self> {
        let controller = TaskRunner::spawn("switchyard-controller")?;
        let io = IoThread::spawn("switchyard-io")?;
        let core = Arc::new(Core::with_task_runner(limits, controller.handle()));
        let channels = ChannelManager::new(Arc::clone(&core), io.handle());

        let (events, queue) = ShellEventQueue::new();
        channels.set_delegate(Arc::new(ShellChannelDelegate {
            events: events.clone(),
        }));
        let resolver = UrlResolver::for_current_exe()?;
        let manager = ApplicationManager::new(Arc::clone(&core), resolver, events.clone())?;

        debug!(?limits, "shell context created");
        Ok(Self {
            core,
            channels,
            manager,
            native_loader: None,
            events,
            queue,
            pending: BTreeSet::new(),
            quit: false,
            io: Some(io),
            controller: Some(controller),
        })
    }

    /// Create and [`init`](Self::init) a context from `config`.
    ///
    /// # Errors
    ///
    /// See [`ShellContext::new`] and [`ShellContext::init`].
    pub fn from_config(config: &Config) -> ShellResult<Self> {
        let mut context = Self::new(limits_from_config(&config.system))?;
        context.init(config)?;
        Ok(context)
    }

    /// Apply `config` and install the native loader for `file:` URLs, loading
    /// code units as shared libraries.
    ///
    /// # Errors
    ///
    /// See [`ShellContext::init_with_code_loader`].
    pub fn init(&mut self, config: &Config) -> ShellResult<()> {
        self.init_with_code_loader(config, Arc::new(NativeLibraryLoader))
    }

    /// Apply `config` and install the native loader for `file:` URLs, loading
    /// code units with `code_loader`.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidUrl`](crate::ShellError::InvalidUrl) for a
    /// malformed origin, mapping or `args_for` key, and
    /// [`ShellError::Io`](crate::ShellError::Io) if the default child path cannot
    /// be determined.
    pub fn init_with_code_loader(
        &mut self,
        config: &Config,
        code_loader: Arc<dyn CodeUnitLoader>,
    ) -> ShellResult<()> {
        let shell = &config.shell;
        if let Some(origin) = &shell.origin {
            self.manager.resolver_mut().set_origin(AppUrl::parse(origin)?);
        }
        for (from, to) in &shell.url_mappings {
            let (from, to) = (AppUrl::parse(from)?, AppUrl::parse(to)?);
            self.manager.resolver_mut().add_mapping(&from, &to);
        }
        for (url, args) in &shell.args_for {
            let url = AppUrl::parse(url)?;
            let resolved = self.manager.resolver().resolve(&url);
            self.manager.set_args_for_url(&url, args.clone());
            if resolved != url {
                self.manager.set_args_for_url(&resolved, args.clone());
            }
        }

        let child_path = match &shell.child_path {
            Some(path) => path.clone(),
            None => default_child_path()?,
        };
        let child = ChildProcessOptions {
            core: Arc::clone(&self.core),
            channels: self.channels.clone(),
            child_path,
            log_level: Some(child_log_filter(config)),
            limits: *self.core.limits(),
        };
        let factory = NativeRunnerFactory::new(
            Arc::clone(&self.core),
            code_loader,
            child,
            shell.enable_multiprocess,
        );
        let native = Arc::new(NativeApplicationLoader::new(
            Arc::clone(&self.core),
            factory,
            self.events.clone(),
        ));
        self.manager.set_loader_for_scheme("file", Arc::clone(&native) as _);
        if let Some(previous) = self.native_loader.replace(native) {
            previous.shutdown();
        }

        info!(
            origin = %self.manager.resolver().origin(),
            multiprocess = shell.enable_multiprocess,
            mappings = shell.url_mappings.len(),
            "shell initialized"
        );
        Ok(())
    }

    /// The core shared by every component.
    #[must_use]
    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// The channel manager.
    #[must_use]
    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    /// The application manager.
    #[must_use]
    pub fn manager(&self) -> &ApplicationManager {
        &self.manager
    }

    /// Mutable access to the application manager, for registering loaders.
    pub fn manager_mut(&mut self) -> &mut ApplicationManager {
        &mut self.manager
    }

    /// A sender for posting work to the shell thread.
    #[must_use]
    pub fn event_sender(&self) -> ShellEventSender {
        self.events.clone()
    }

    /// URLs started with [`ShellContext::run`] that are still running.
    #[must_use]
    pub fn pending(&self) -> &BTreeSet<AppUrl> {
        &self.pending
    }

    /// Start the application at `url` on behalf of the shell. The event loop
    /// keeps running until every application started this way terminated.
    pub fn run(&mut self, url: &AppUrl) {
        let requestor = self.manager.shell_url().clone();
        if self.manager.connect_to_application(url, &requestor, ServicePipes::default()) {
            self.pending.insert(url.clone());
        } else {
            warn!(url = %url, "no application could be started for URL");
        }
    }

    /// Ask the application at `url` for service `name`; see
    /// [`ApplicationManager::connect_to_service_by_name`].
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::System`](crate::ShellError::System) if pipes cannot be created.
    pub fn connect_to_service_by_name(&mut self, url: &AppUrl, name: &str) -> ShellResult<Handle> {
        self.manager.connect_to_service_by_name(url, name)
    }

    /// Stop the event loop after the current event.
    pub fn quit(&mut self) {
        self.quit = true;
    }

    /// Process every queued event without blocking.
    pub fn run_until_idle(&mut self) {
        while let Some(event) = self.queue.try_next() {
            self.dispatch(event);
        }
    }

    /// Process events until [`ShellEvent::Quit`] arrives or every application
    /// started with [`ShellContext::run`] has terminated.
    pub fn run_event_loop(&mut self) {
        self.quit = false;
        while !self.should_stop() {
            if let Some(event) = self.queue.next_timeout(IDLE_POLL) {
                self.dispatch(event);
            }
        }
        debug!(quit = self.quit, "event loop stopped");
    }

    /// Like [`ShellContext::run_event_loop`], giving up after `timeout`.
    /// Returns whether the loop stopped on its own.
    pub fn run_event_loop_timeout(&mut self, timeout: Duration) -> bool {
        self.quit = false;
        let deadline = Instant::now().checked_add(timeout);
        while !self.should_stop() {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => IDLE_POLL,
            };
            if remaining.is_zero() {
                return false;
            }
            if let Some(event) = self.queue.next_timeout(remaining.min(IDLE_POLL)) {
                self.dispatch(event);
            }
        }
        true
    }

    fn should_stop(&self) -> bool {
        self.quit || self.pending.is_empty()
    }

    fn dispatch(&mut self, event: ShellEvent) {
        match event {
            ShellEvent::Task(task) => task(),
            ShellEvent::ApplicationSignaled(id) => {
                let Some(requested) = self.manager.handle_application_signal(id) else {
                    return;
                };
                self.pending.remove(&requested);
                if self.manager.running_count() == 0 && !self.pending.is_empty() {
                    // Started under another URL alias; nothing is left to wait for.
                    self.pending.clear();
                }
            },
            ShellEvent::Quit => self.quit = true,
        }
    }

    /// Terminate applications, stop runners, drain channels and stop the
    /// threads. Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        let Some(io) = self.io.take() else {
            return;
        };
        info!(running = self.manager.running_count(), "shell shutting down");
        self.manager.terminate_all();
        if let Some(native) = self.native_loader.take() {
            native.shutdown();
        }
        // Completions posted by the runners above.
        self.run_until_idle();
        if let Err(e) = self.channels.shutdown(CHANNEL_FLUSH_TIMEOUT) {
            warn!(error = %e, "channel shutdown failed");
        }
        self.core.close_all();
        io.shutdown();
        if let Some(controller) = self.controller.take() {
            controller.shutdown();
        }
        self.pending.clear();
    }
}

impl Drop for ShellContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ShellContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellContext")
            .field("manager", &self.manager)
            .field("pending", &self.pending)
            .field("quit", &self.quit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_from_config() {
        let limits = limits_from_config(&SystemSection::default());
        assert_eq!(limits, SystemLimits::default());
    }

    #[test]
    fn test_child_log_filter_includes_directives() {
        let mut config = Config::default();
        config.logging.level = "debug".to_owned();
        config.logging.directives = vec!["switchyard_channel=trace".to_owned()];
        assert_eq!(child_log_filter(&config), "debug,switchyard_channel=trace");
    }

    #[test]
    fn test_default_child_path_is_next_to_exe() {
        let path = default_child_path().unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(path.parent(), exe.parent());
        assert_eq!(path.file_name().unwrap(), CHILD_BINARY_NAME);
    }

    #[test]
    fn test_run_without_loader_does_not_wait() {
        let mut context = ShellContext::new(SystemLimits::default()).unwrap();
        let url = AppUrl::parse("custom:nothing").unwrap();
        context.run(&url);
        assert!(context.pending().is_empty());
        assert!(context.run_event_loop_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_quit_event_stops_loop() {
        let mut context = ShellContext::new(SystemLimits::default()).unwrap();
        context.pending.insert(AppUrl::parse("app:waiting").unwrap());
        context.event_sender().send(ShellEvent::Quit);
        assert!(context.run_event_loop_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut context = ShellContext::new(SystemLimits::default()).unwrap();
        context.shutdown();
        context.shutdown();
    }
}
