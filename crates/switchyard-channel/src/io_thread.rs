//! The IO thread: owns every channel's socket and runs their reader and
//! writer futures on a current-thread `tokio` runtime.

use std::future::Future;
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, warn};

use crate::error::{ChannelError, ChannelResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Envelope {
    Run(Task),
    Quit,
}

/// The dedicated IO thread. Dropping it stops the runtime, which cancels any
/// I/O futures still running.
pub struct IoThread {
    handle: IoThreadHandle,
    thread: Option<JoinHandle<()>>,
}

/// A cloneable way to post work to the [`IoThread`].
#[derive(Clone)]
pub struct IoThreadHandle {
    name: Arc<str>,
    sender: tokio_mpsc::UnboundedSender<Envelope>,
    runtime: tokio::runtime::Handle,
    thread_id: ThreadId,
}

impl IoThread {
    /// Start the IO thread.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] if the thread or its runtime cannot be created.
    pub fn spawn(name: impl Into<String>) -> ChannelResult<Self> {
        let name: String = name.into();
        let (sender, mut receiver) = tokio_mpsc::unbounded_channel::<Envelope>();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                },
            };
            let _ = ready_tx.send(Ok(runtime.handle().clone()));
            runtime.block_on(async move {
                while let Some(envelope) = receiver.recv().await {
                    match envelope {
                        Envelope::Run(task) => task(),
                        Envelope::Quit => break,
                    }
                }
            });
        })?;

        let runtime = ready_rx
            .recv()
            .map_err(|_| ChannelError::IoThreadStopped)??;
        debug!(thread = %name, "IO thread started");
        Ok(Self {
            handle: IoThreadHandle {
                name: name.into(),
                sender,
                runtime,
                thread_id: thread.thread().id(),
            },
            thread: Some(thread),
        })
    }

    /// A handle for posting tasks.
    #[must_use]
    pub fn handle(&self) -> IoThreadHandle {
        self.handle.clone()
    }

    /// Stop after the tasks already posted have run, and join the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.handle.sender.send(Envelope::Quit);
        if self.handle.runs_tasks_on_current_thread() {
            warn!(thread = %self.handle.name, "IO thread stopped from itself; not joining");
            return;
        }
        if thread.join().is_err() {
            warn!(thread = %self.handle.name, "IO thread panicked");
        }
        debug!(thread = %self.handle.name, "IO thread stopped");
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for IoThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoThread")
            .field("name", &self.handle.name)
            .finish_non_exhaustive()
    }
}

impl IoThreadHandle {
    /// Queue `task` to run on the IO thread after everything posted before it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::IoThreadStopped`] once the thread has stopped.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> ChannelResult<()> {
        self.sender
            .send(Envelope::Run(Box::new(task)))
            .map_err(|_| ChannelError::IoThreadStopped)
    }

    /// Run `task` on the IO thread and wait for its result. Runs inline when
    /// already on the IO thread.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::IoThreadStopped`] if the thread stopped before
    /// the task ran.
    pub fn post_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce() -> R + Send + 'static,
    ) -> ChannelResult<R> {
        if self.runs_tasks_on_current_thread() {
            return Ok(task());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.post(move || {
            let _ = tx.send(task());
        })?;
        rx.recv().map_err(|_| ChannelError::IoThreadStopped)
    }

    /// Spawn an I/O future on the IO thread's runtime.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Whether the caller is on the IO thread.
    #[must_use]
    pub fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for IoThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoThreadHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_tasks_run_in_order_on_io_thread() {
        let io = IoThread::spawn("test-io").unwrap();
        let handle = io.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            let h = handle.clone();
            handle
                .post(move || {
                    assert!(h.runs_tasks_on_current_thread());
                    seen.lock().unwrap().push(i);
                })
                .unwrap();
        }
        let on_io = handle.post_and_wait(|| thread::current().name().map(str::to_owned)).unwrap();
        assert_eq!(on_io.as_deref(), Some("test-io"));
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(!handle.runs_tasks_on_current_thread());
    }

    #[test]
    fn test_spawned_futures_run() {
        let io = IoThread::spawn("test-io").unwrap();
        let handle = io.handle();
        let (tx, rx) = mpsc::channel();
        handle.spawn(async move {
            tokio::task::yield_now().await;
            let _ = tx.send(7);
        });
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn test_post_after_shutdown_fails() {
        let io = IoThread::spawn("test-io").unwrap();
        let handle = io.handle();
        io.shutdown();
        assert!(matches!(handle.post(|| {}), Err(ChannelError::IoThreadStopped)));
    }
}
