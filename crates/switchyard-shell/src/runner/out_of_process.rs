//! Runs a code unit in a child process.

use std::path::Path;

use switchyard_system::{Handle, ResultCode};
use tracing::error;

use crate::child_host::{ChildProcessHost, ChildProcessOptions};
use crate::code_unit::CleanupPolicy;
use crate::completion::AppCompletion;
use crate::runner::NativeRunner;

/// Exit status requested from a child whose runner is dropped early.
pub const ABANDONED_EXIT_CODE: i32 = 10;

/// Out-of-process runner. Dropping it reaps the child, asking it to exit
/// first if the application has not completed.
pub struct OutOfProcessRunner {
    options: ChildProcessOptions,
    host: Option<ChildProcessHost>,
}

impl OutOfProcessRunner {
    /// A runner launching children as described by `options`.
    #[must_use]
    pub fn new(options: ChildProcessOptions) -> Self {
        Self { options, host: None }
    }
}

impl NativeRunner for OutOfProcessRunner {
    fn start(
        &mut self,
        app_path: &Path,
        cleanup: CleanupPolicy,
        application_request: Handle,
        completion: AppCompletion,
    ) {
        let mut host = ChildProcessHost::new(self.options.clone());
        if let Err(e) = host.start() {
            error!(path = %app_path.display(), error = %e, "failed to start child process");
            let _ = self.options.core.close(application_request);
            completion.complete_with(ResultCode::Unavailable);
            return;
        }
        host.start_app(app_path, cleanup, application_request, completion);
        self.host = Some(host);
    }
}

impl Drop for OutOfProcessRunner {
    fn drop(&mut self) {
        if let Some(mut host) = self.host.take() {
            if !host.state().is_completed() {
                host.exit_now(ABANDONED_EXIT_CODE);
            }
            host.join();
        }
    }
}

impl std::fmt::Debug for OutOfProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutOfProcessRunner")
            .field("state", &self.host.as_ref().map(ChildProcessHost::state))
            .finish_non_exhaustive()
    }
}
