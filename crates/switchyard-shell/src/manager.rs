//! The [`ApplicationManager`]: routes connection requests to running
//! applications or to the loader that can start them.
//!
//! Lives on the shell thread. Its maps are never touched from anywhere else.

use std::collections::HashMap;
use std::sync::Arc;

use switchyard_system::{Core, Handle, Signals, SystemError};
use tracing::{debug, info, warn};

use crate::app_url::AppUrl;
use crate::error::{ShellError, ShellResult};
use crate::events::{ShellEvent, ShellEventSender};
use crate::loader::ApplicationLoader;
use crate::protocol::{
    ApplicationMessage, ServiceMessage, ServicePipes, ShellMessage, read_json, write_json,
};
use crate::resolver::UrlResolver;

/// URL used as the requestor for connections made by the shell itself.
pub const SHELL_URL: &str = "switchyard:shell";

/// Identifies one running application within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(u64);

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "app-{}", self.0)
    }
}

struct RunningApplication {
    /// Identity: the loaded URL without its query.
    url: AppUrl,
    /// The URL the first connection asked for.
    requested_url: AppUrl,
    /// Shell end of the application pipe.
    pipe: Handle,
    loader: Arc<dyn ApplicationLoader>,
}

/// Registry of loaders and running applications.
pub struct ApplicationManager {
    core: Arc<Core>,
    resolver: UrlResolver,
    events: ShellEventSender,
    shell_url: AppUrl,
    url_loaders: HashMap<AppUrl, Arc<dyn ApplicationLoader>>,
    scheme_loaders: HashMap<String, Arc<dyn ApplicationLoader>>,
    default_loader: Option<Arc<dyn ApplicationLoader>>,
    url_args: HashMap<AppUrl, Vec<String>>,
    apps: HashMap<AppId, RunningApplication>,
    by_url: HashMap<AppUrl, AppId>,
    next_id: u64,
}

impl ApplicationManager {
    /// Create a manager. Application pipe notifications are posted to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidUrl`] only if [`SHELL_URL`] fails to parse.
    pub fn new(
        core: Arc<Core>,
        resolver: UrlResolver,
        events: ShellEventSender,
    ) -> ShellResult<Self> {
        Ok(Self {
            core,
            resolver,
            events,
            shell_url: AppUrl::parse(SHELL_URL)?,
            url_loaders: HashMap::new(),
            scheme_loaders: HashMap::new(),
            default_loader: None,
            url_args: HashMap::new(),
            apps: HashMap::new(),
            by_url: HashMap::new(),
            next_id: 1,
        })
    }

    /// The resolver in use.
    #[must_use]
    pub fn resolver(&self) -> &UrlResolver {
        &self.resolver
    }

    /// Mutable access to the resolver, for adding mappings.
    pub fn resolver_mut(&mut self) -> &mut UrlResolver {
        &mut self.resolver
    }

    /// The requestor URL used for the shell's own connections.
    #[must_use]
    pub fn shell_url(&self) -> &AppUrl {
        &self.shell_url
    }

    /// Use `loader` for exactly `url` (query ignored).
    pub fn set_loader_for_url(&mut self, url: &AppUrl, loader: Arc<dyn ApplicationLoader>) {
        self.url_loaders.insert(url.without_query(), loader);
    }

    /// Use `loader` for every URL with `scheme`.
    pub fn set_loader_for_scheme(&mut self, scheme: &str, loader: Arc<dyn ApplicationLoader>) {
        self.scheme_loaders.insert(scheme.to_owned(), loader);
    }

    /// Use `loader` when nothing more specific matches. `None` removes it.
    pub fn set_default_loader(&mut self, loader: Option<Arc<dyn ApplicationLoader>>) {
        self.default_loader = loader;
    }

    /// Startup arguments for `url`, placed before any query arguments.
    pub fn set_args_for_url(&mut self, url: &AppUrl, args: Vec<String>) {
        self.url_args.insert(url.without_query(), args);
    }

    /// Number of running applications.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.apps.len()
    }

    /// Whether an application with this identity is running.
    #[must_use]
    pub fn is_running(&self, url: &AppUrl) -> bool {
        self.by_url.contains_key(&url.without_query())
    }

    /// Connect `requestor` to the application at `url`.
    ///
    /// Reuses a running application when one matches the mapped or resolved
    /// URL; otherwise asks at most one loader to start it. With no loader the
    /// pipes are closed and nothing else happens.
    ///
    /// Returns whether the request reached an application.
    pub fn connect_to_application(
        &mut self,
        url: &AppUrl,
        requestor: &AppUrl,
        pipes: ServicePipes,
    ) -> bool {
        let mapped = self.resolver.apply_mappings(url);
        let Some(pipes) = self.connect_to_running(&mapped, requestor, pipes) else {
            return true;
        };
        let resolved = self.resolver.resolve_app_url(&mapped);
        let Some(pipes) = self.connect_to_running(&resolved, requestor, pipes) else {
            return true;
        };

        let choice = self
            .loader_for(&mapped)
            .map(|loader| (mapped.clone(), loader))
            .or_else(|| self.loader_for(&resolved).map(|loader| (resolved.clone(), loader)))
            .or_else(|| {
                self.default_loader
                    .clone()
                    .map(|loader| (resolved.clone(), loader))
            });

        match choice {
            Some((load_url, loader)) => {
                self.start_with_loader(&load_url, url, requestor, pipes, loader)
            },
            None => {
                debug!(url = %url, resolved = %resolved, "no loader for URL; dropping request");
                pipes.close(&self.core);
                false
            },
        }
    }

    /// Ask the application at `url` for the service `name` and return the
    /// local end of the service pipe.
    ///
    /// A lookup that fails is not reported: the returned pipe's peer is
    /// simply closed.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::System`] if pipes cannot be created.
    pub fn connect_to_service_by_name(&mut self, url: &AppUrl, name: &str) -> ShellResult<Handle> {
        let (services, services_request) = self.core.create_message_pipe()?;
        let requestor = self.shell_url.clone();
        let _ = self.connect_to_application(
            url,
            &requestor,
            ServicePipes {
                services: Some(services_request),
                exposed_services: None,
            },
        );

        let (local, remote) = self.core.create_message_pipe()?;
        let message = ServiceMessage::ConnectToService {
            name: name.to_owned(),
        };
        if let Err(e) = write_json(&self.core, services, &message, &[remote]) {
            debug!(url = %url, service = name, error = %e, "service request not delivered");
            let _ = self.core.close(remote);
        }
        let _ = self.core.close(services);
        Ok(local)
    }

    /// Handle a signal on application `id`'s pipe: serve its requests and,
    /// if it has gone away, forget it.
    ///
    /// Returns the URL originally requested for the application when it
    /// terminated.
    pub fn handle_application_signal(&mut self, id: AppId) -> Option<AppUrl> {
        let (pipe, requestor) = {
            let app = self.apps.get(&id)?;
            (app.pipe, app.url.clone())
        };

        let mut requests = Vec::new();
        let closed = loop {
            match read_json::<ApplicationMessage>(&self.core, pipe) {
                Ok((
                    ApplicationMessage::ConnectToApplication {
                        url,
                        has_services,
                        has_exposed_services,
                    },
                    handles,
                )) => {
                    match ServicePipes::from_handles(has_services, has_exposed_services, &handles) {
                        Ok(pipes) => requests.push((url, pipes)),
                        Err(e) => {
                            warn!(app = %requestor, error = %e, "malformed connection request");
                            for handle in handles {
                                let _ = self.core.close(handle);
                            }
                        },
                    }
                },
                Err(ShellError::System(SystemError::ShouldWait)) => break false,
                Err(ShellError::Protocol(e)) => {
                    warn!(app = %requestor, error = %e, "ignoring malformed application message");
                },
                Err(e) => {
                    debug!(app = %requestor, error = %e, "application pipe closed");
                    break true;
                },
            }
        };

        for (url, pipes) in requests {
            let _ = self.connect_to_application(&url, &requestor, pipes);
        }

        if closed {
            return self.remove_application(id);
        }
        self.watch(id, pipe);
        None
    }

    /// Close every application pipe. Loaders are not notified.
    pub fn terminate_all(&mut self) {
        let count = self.apps.len();
        for (_, app) in self.apps.drain() {
            let _ = self.core.close(app.pipe);
        }
        self.by_url.clear();
        if count > 0 {
            info!(count, "closed all application connections");
        }
    }

    fn loader_for(&self, url: &AppUrl) -> Option<Arc<dyn ApplicationLoader>> {
        self.url_loaders
            .get(&url.without_query())
            .or_else(|| self.scheme_loaders.get(url.scheme()))
            .cloned()
    }

    /// Deliver a connection to a running application. Gives the pipes back
    /// if nothing matches.
    fn connect_to_running(
        &self,
        url: &AppUrl,
        requestor: &AppUrl,
        pipes: ServicePipes,
    ) -> Option<ServicePipes> {
        let running = self.by_url.get(&url.without_query());
        let Some(app) = running.and_then(|id| self.apps.get(id)) else {
            return Some(pipes);
        };
        debug!(url = %url, app = %app.url, "connecting to running application");
        self.accept_connection(app.pipe, requestor, url, pipes);
        None
    }

    fn accept_connection(
        &self,
        pipe: Handle,
        requestor: &AppUrl,
        resolved: &AppUrl,
        pipes: ServicePipes,
    ) {
        let message = ShellMessage::AcceptConnection {
            requestor_url: requestor.clone(),
            resolved_url: resolved.clone(),
            has_services: pipes.services.is_some(),
            has_exposed_services: pipes.exposed_services.is_some(),
        };
        if let Err(e) = write_json(&self.core, pipe, &message, &pipes.handles()) {
            debug!(url = %resolved, error = %e, "connection not delivered");
            pipes.close(&self.core);
        }
    }

    fn start_with_loader(
        &mut self,
        url: &AppUrl,
        requested: &AppUrl,
        requestor: &AppUrl,
        pipes: ServicePipes,
        loader: Arc<dyn ApplicationLoader>,
    ) -> bool {
        let (pipe, request) = match self.core.create_message_pipe() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(url = %url, error = %e, "cannot create application pipe");
                pipes.close(&self.core);
                return false;
            },
        };

        let identity = url.without_query();
        let mut args = self.url_args.get(&identity).cloned().unwrap_or_default();
        args.extend(url.query_args());

        let initialize = ShellMessage::Initialize {
            url: identity.clone(),
            args,
        };
        if let Err(e) = write_json(&self.core, pipe, &initialize, &[]) {
            warn!(url = %url, error = %e, "cannot initialize application");
        }
        self.accept_connection(pipe, requestor, url, pipes);

        let id = AppId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        info!(url = %identity, requested = %requested, app = %id, "starting application");
        self.by_url.insert(identity.clone(), id);
        self.apps.insert(
            id,
            RunningApplication {
                url: identity,
                requested_url: requested.clone(),
                pipe,
                loader: Arc::clone(&loader),
            },
        );
        self.watch(id, pipe);

        loader.load(url, request);
        true
    }

    fn watch(&self, id: AppId, pipe: Handle) {
        let events = self.events.clone();
        let armed = self.core.async_wait(
            pipe,
            Signals::READABLE | Signals::PEER_CLOSED,
            move |result| {
                if result != Err(SystemError::Cancelled) {
                    events.send(ShellEvent::ApplicationSignaled(id));
                }
            },
        );
        if let Err(e) = armed {
            warn!(app = %id, error = %e, "cannot watch application pipe");
        }
    }

    fn remove_application(&mut self, id: AppId) -> Option<AppUrl> {
        let app = self.apps.remove(&id)?;
        if self.by_url.get(&app.url) == Some(&id) {
            self.by_url.remove(&app.url);
        }
        let _ = self.core.close(app.pipe);
        info!(url = %app.url, app = %id, "application terminated");
        app.loader.on_application_error(&app.url);
        Some(app.requested_url)
    }
}

impl std::fmt::Debug for ApplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationManager")
            .field("running", &self.apps.len())
            .field("url_loaders", &self.url_loaders.len())
            .field("scheme_loaders", &self.scheme_loaders.len())
            .field("default_loader", &self.default_loader.is_some())
            .finish_non_exhaustive()
    }
}
