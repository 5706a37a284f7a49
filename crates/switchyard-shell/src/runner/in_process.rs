//! Runs a code unit on a worker thread inside the shell process.

use std::path::Path;
use std::sync::Arc;

use switchyard_system::{Core, Handle};
use tracing::{error, info};

use crate::code_unit::{CleanupPolicy, CodeUnitLoader};
use crate::completion::AppCompletion;
use crate::runner::NativeRunner;
use crate::runner::worker::WorkerTask;

/// In-process runner. Dropping it joins the worker and unloads the code.
pub struct InProcessRunner {
    core: Arc<Core>,
    code_loader: Arc<dyn CodeUnitLoader>,
    worker: Option<WorkerTask>,
}

impl InProcessRunner {
    /// A runner loading code with `code_loader` and handing it handles in `core`.
    #[must_use]
    pub fn new(core: Arc<Core>, code_loader: Arc<dyn CodeUnitLoader>) -> Self {
        Self {
            core,
            code_loader,
            worker: None,
        }
    }
}

impl NativeRunner for InProcessRunner {
    fn start(
        &mut self,
        app_path: &Path,
        cleanup: CleanupPolicy,
        application_request: Handle,
        completion: AppCompletion,
    ) {
        let unit = match self.code_loader.load(app_path) {
            Ok(unit) => unit,
            Err(e) => {
                error!(path = %app_path.display(), error = %e, "failed to load application");
                let _ = self.core.close(application_request);
                completion.complete_with(e.code());
                return;
            },
        };

        let name = app_path
            .file_stem()
            .map_or_else(|| "app".to_owned(), |s| format!("app-{}", s.to_string_lossy()));
        let core = Arc::clone(&self.core);
        let path = app_path.to_path_buf();
        let spawned = WorkerTask::spawn(
            name,
            unit,
            Some((cleanup, app_path.to_path_buf())),
            move |unit| {
                let result = unit.run(&core, application_request);
                // The application may have closed or passed it already.
                let _ = core.close(application_request);
                info!(path = %path.display(), result, "application returned");
                completion.complete(result);
            },
        );
        match spawned {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                error!(
                    path = %app_path.display(),
                    error = %e,
                    "failed to start application thread"
                );
                let _ = self.core.close(application_request);
            },
        }
    }
}

impl Drop for InProcessRunner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
    }
}

impl std::fmt::Debug for InProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessRunner")
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}
