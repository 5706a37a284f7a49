//! A worker thread that owns a reference to the code it runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::code_unit::{CleanupPolicy, CodeUnit};
use crate::error::{ShellError, ShellResult};

/// Runs a code unit on its own thread.
///
/// Dropping the task joins the thread first, then releases the code unit,
/// then applies the cleanup policy. Thread-local destructors registered by
/// the code therefore run while it is still loaded.
pub struct WorkerTask {
    name: String,
    thread: Option<JoinHandle<()>>,
    unit: Option<Arc<dyn CodeUnit>>,
    cleanup: Option<(CleanupPolicy, PathBuf)>,
}

impl WorkerTask {
    /// Spawn a thread called `name` running `body` against `unit`.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Thread`] if the thread cannot be spawned; `body`
    /// is dropped without running.
    pub fn spawn(
        name: impl Into<String>,
        unit: Arc<dyn CodeUnit>,
        cleanup: Option<(CleanupPolicy, PathBuf)>,
        body: impl FnOnce(&dyn CodeUnit) + Send + 'static,
    ) -> ShellResult<Self> {
        let name = name.into();
        let worker_unit = Arc::clone(&unit);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(worker_unit.as_ref()))
            .map_err(|e| ShellError::Thread(format!("failed to spawn {name}: {e}")))?;
        debug!(thread = %name, "worker started");
        Ok(Self {
            name,
            thread: Some(thread),
            unit: Some(unit),
            cleanup,
        })
    }

    /// Whether the thread has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Join, unload and clean up now.
    pub fn join(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(thread = %self.name, "worker thread panicked");
            }
            debug!(thread = %self.name, "worker joined");
        }
        drop(self.unit.take());
        if let Some((policy, path)) = self.cleanup.take() {
            policy.apply(&path);
        }
    }
}

impl Drop for WorkerTask {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for WorkerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTask")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    use switchyard_system::{Core, Handle};

    use super::*;

    struct DropFlag {
        dropped: Arc<AtomicBool>,
    }

    impl CodeUnit for DropFlag {
        fn run(&self, _core: &Arc<Core>, _request: Handle) -> i32 {
            0
        }
    }

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_unit_released_only_after_join() {
        let dropped = Arc::new(AtomicBool::new(false));
        let unit: Arc<dyn CodeUnit> = Arc::new(DropFlag {
            dropped: Arc::clone(&dropped),
        });
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let observed = Arc::clone(&dropped);
        let (seen_tx, seen_rx) = mpsc::channel();

        let task = WorkerTask::spawn("worker-test", unit, None, move |_unit| {
            go_rx.recv().unwrap();
            seen_tx.send(observed.load(Ordering::SeqCst)).unwrap();
        })
        .unwrap();

        go_tx.send(()).unwrap();
        task.join();
        assert!(!seen_rx.recv().unwrap(), "unit released while the worker ran");
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cleanup_runs_after_join() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transient.app");
        std::fs::write(&path, b"x").unwrap();
        let unit: Arc<dyn CodeUnit> = Arc::new(DropFlag {
            dropped: Arc::new(AtomicBool::new(false)),
        });
        let task = WorkerTask::spawn(
            "worker-cleanup",
            unit,
            Some((CleanupPolicy::DeleteAppPath, path.clone())),
            |_unit| {},
        )
        .unwrap();
        drop(task);
        assert!(!path.exists());
    }
}
