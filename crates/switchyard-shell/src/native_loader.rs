//! Loader for `file:` URLs naming native code units.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use switchyard_system::{Core, Handle};
use tracing::{debug, error, info};

use crate::app_url::AppUrl;
use crate::code_unit::CleanupPolicy;
use crate::completion::AppCompletion;
use crate::events::ShellEventSender;
use crate::loader::ApplicationLoader;
use crate::runner::{NativeRunner, NativeRunnerFactory};

type RunnerMap = HashMap<u64, Box<dyn NativeRunner>>;

/// Runs each `file:` URL with a fresh [`NativeRunner`] and keeps the runner
/// alive until its application completes.
pub struct NativeApplicationLoader {
    core: Arc<Core>,
    factory: NativeRunnerFactory,
    events: ShellEventSender,
    runners: Arc<Mutex<RunnerMap>>,
    next_runner: AtomicU64,
}

impl NativeApplicationLoader {
    /// Runners come from `factory`; completions are processed on the shell
    /// thread through `events`.
    #[must_use]
    pub fn new(core: Arc<Core>, factory: NativeRunnerFactory, events: ShellEventSender) -> Self {
        Self {
            core,
            factory,
            events,
            runners: Arc::new(Mutex::new(HashMap::new())),
            next_runner: AtomicU64::new(1),
        }
    }

    /// Number of runners whose application has not completed.
    #[must_use]
    pub fn active_runners(&self) -> usize {
        lock(&self.runners).len()
    }

    /// Drop every runner, waiting for each application to be torn down.
    pub fn shutdown(&self) {
        let drained: Vec<_> = lock(&self.runners).drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "stopping native runners");
        }
        drop(drained);
    }
}

fn lock(runners: &Mutex<RunnerMap>) -> MutexGuard<'_, RunnerMap> {
    runners.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ApplicationLoader for NativeApplicationLoader {
    fn load(&self, url: &AppUrl, application_request: Handle) {
        let path = match url.to_file_path() {
            Ok(path) if path.is_file() => path,
            Ok(path) => {
                error!(url = %url, path = %path.display(), "application not found");
                let _ = self.core.close(application_request);
                return;
            },
            Err(e) => {
                error!(url = %url, error = %e, "not a native application url");
                let _ = self.core.close(application_request);
                return;
            },
        };

        let id = self.next_runner.fetch_add(1, Ordering::Relaxed);
        let mut runner = self.factory.create();

        // The runner is dropped on the shell thread. Load runs there too, so
        // the removal always observes the insert below.
        let runners = Arc::clone(&self.runners);
        let app = url.clone();
        let completion = AppCompletion::on_shell_thread(&self.events, move |result| {
            info!(url = %app, result, "native application completed");
            let runner = lock(&runners).remove(&id);
            drop(runner);
        });

        debug!(
            url = %url,
            runner = id,
            multiprocess = self.factory.is_multiprocess(),
            "starting native application"
        );
        runner.start(&path, CleanupPolicy::KeepAppPath, application_request, completion);
        lock(&self.runners).insert(id, runner);
    }
}

impl Drop for NativeApplicationLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for NativeApplicationLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeApplicationLoader")
            .field("factory", &self.factory)
            .field("active_runners", &self.active_runners())
            .finish_non_exhaustive()
    }
}
