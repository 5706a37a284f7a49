//! Named threads that run posted tasks in order.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, warn};

use crate::error::{SystemError, SystemResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Envelope {
    Run(Task),
    Quit,
}

/// An OS thread draining a FIFO queue of tasks.
///
/// Dropping the runner stops it after the tasks already queued have run.
pub struct TaskRunner {
    handle: TaskRunnerHandle,
    thread: Option<JoinHandle<()>>,
}

/// A cloneable way to post work to a [`TaskRunner`].
#[derive(Clone)]
pub struct TaskRunnerHandle {
    name: Arc<str>,
    sender: mpsc::Sender<Envelope>,
    thread_id: ThreadId,
}

impl TaskRunner {
    /// Start a runner thread called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ResourceExhausted`] if the thread cannot be spawned.
    pub fn spawn(name: impl Into<String>) -> SystemResult<Self> {
        let name: String = name.into();
        let (sender, receiver) = mpsc::channel::<Envelope>();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Ok(envelope) = receiver.recv() {
                    match envelope {
                        Envelope::Run(task) => task(),
                        Envelope::Quit => break,
                    }
                }
            })
            .map_err(|e| {
                SystemError::ResourceExhausted(format!("failed to spawn thread {name}: {e}"))
            })?;
        debug!(thread = %name, "task runner started");
        Ok(Self {
            handle: TaskRunnerHandle {
                name: name.into(),
                sender,
                thread_id: thread.thread().id(),
            },
            thread: Some(thread),
        })
    }

    /// A handle for posting tasks.
    #[must_use]
    pub fn handle(&self) -> TaskRunnerHandle {
        self.handle.clone()
    }

    /// Stop the runner once queued tasks have run, and join its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.handle.sender.send(Envelope::Quit);
        if self.handle.runs_tasks_on_current_thread() {
            warn!(
                thread = %self.handle.name,
                "task runner stopped from its own thread; not joining"
            );
            return;
        }
        if thread.join().is_err() {
            warn!(thread = %self.handle.name, "task runner thread panicked");
        }
        debug!(thread = %self.handle.name, "task runner stopped");
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("name", &self.handle.name)
            .finish_non_exhaustive()
    }
}

impl TaskRunnerHandle {
    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `task` to run after everything posted before it.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::FailedPrecondition`] if the runner has stopped.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> SystemResult<()> {
        self.sender
            .send(Envelope::Run(Box::new(task)))
            .map_err(|_| SystemError::precondition(format!("task runner {} stopped", self.name)))
    }

    /// Run `task` on the runner and wait for its result.
    ///
    /// Runs inline when called from the runner thread itself.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::FailedPrecondition`] if the runner stopped
    /// before the task ran.
    pub fn post_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce() -> R + Send + 'static,
    ) -> SystemResult<R> {
        if self.runs_tasks_on_current_thread() {
            return Ok(task());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.post(move || {
            let _ = tx.send(task());
        })?;
        rx.recv()
            .map_err(|_| SystemError::precondition(format!("task runner {} stopped", self.name)))
    }

    /// Whether the caller is on this runner's thread.
    #[must_use]
    pub fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl std::fmt::Debug for TaskRunnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunnerHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
