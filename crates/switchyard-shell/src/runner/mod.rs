//! Native runners: execute a code unit either on a worker thread or in a
//! child process.

mod in_process;
mod out_of_process;
mod worker;

use std::path::Path;
use std::sync::Arc;

use switchyard_system::{Core, Handle};

pub use in_process::InProcessRunner;
pub use out_of_process::{ABANDONED_EXIT_CODE, OutOfProcessRunner};
pub use worker::WorkerTask;

use crate::child_host::ChildProcessOptions;
use crate::code_unit::{CleanupPolicy, CodeUnitLoader};
use crate::completion::AppCompletion;

/// Starts one application and reports its result through `completion`.
///
/// Dropping a runner waits for its application to be torn down.
pub trait NativeRunner: Send {
    /// Start the code at `app_path` with `application_request` as its
    /// application pipe. `completion` fires exactly once.
    ///
    /// The completion fires on whichever thread observes the end: the worker
    /// thread, the IO thread, or the caller when starting fails. Callers that
    /// need the result on their own thread build it with
    /// [`AppCompletion::on_shell_thread`].
    fn start(
        &mut self,
        app_path: &Path,
        cleanup: CleanupPolicy,
        application_request: Handle,
        completion: AppCompletion,
    );
}

/// Creates runners of the configured kind.
#[derive(Clone)]
pub struct NativeRunnerFactory {
    core: Arc<Core>,
    code_loader: Arc<dyn CodeUnitLoader>,
    child: ChildProcessOptions,
    multiprocess: bool,
}

impl NativeRunnerFactory {
    /// Runners load code with `code_loader` in-process, or launch children per
    /// `child` when `multiprocess` is set.
    #[must_use]
    pub fn new(
        core: Arc<Core>,
        code_loader: Arc<dyn CodeUnitLoader>,
        child: ChildProcessOptions,
        multiprocess: bool,
    ) -> Self {
        Self {
            core,
            code_loader,
            child,
            multiprocess,
        }
    }

    /// Whether runners launch child processes.
    #[must_use]
    pub fn is_multiprocess(&self) -> bool {
        self.multiprocess
    }

    /// A fresh runner.
    #[must_use]
    pub fn create(&self) -> Box<dyn NativeRunner> {
        if self.multiprocess {
            Box::new(OutOfProcessRunner::new(self.child.clone()))
        } else {
            Box::new(InProcessRunner::new(
                Arc::clone(&self.core),
                Arc::clone(&self.code_loader),
            ))
        }
    }
}

impl std::fmt::Debug for NativeRunnerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRunnerFactory")
            .field("multiprocess", &self.multiprocess)
            .finish_non_exhaustive()
    }
}
