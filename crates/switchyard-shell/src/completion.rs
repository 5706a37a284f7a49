//! One-shot application completion.

use switchyard_system::ResultCode;
use tracing::debug;

use crate::events::ShellEventSender;

type Callback = Box<dyn FnOnce(i32) + Send + 'static>;

/// Reports an application's result exactly once.
///
/// Dropping a completion that was never fired reports
/// [`ResultCode::Unknown`], so every path that loses track of an
/// application still produces a result.
pub struct AppCompletion {
    callback: Option<Callback>,
}

impl AppCompletion {
    /// Wrap `callback`.
    pub fn new(callback: impl FnOnce(i32) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Wrap `callback` so that it runs on the shell thread, whichever thread
    /// fires the completion.
    pub fn on_shell_thread(
        events: &ShellEventSender,
        callback: impl FnOnce(i32) + Send + 'static,
    ) -> Self {
        let events = events.clone();
        Self::new(move |result| events.post(move || callback(result)))
    }

    /// A completion that discards its result.
    #[must_use]
    pub fn ignore() -> Self {
        Self::new(|_| {})
    }

    /// Fire with `result`.
    pub fn complete(mut self, result: i32) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    /// Fire with a well-known code.
    pub fn complete_with(self, code: ResultCode) {
        self.complete(code.as_i32());
    }
}

impl Drop for AppCompletion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            debug!("completion dropped before firing; reporting unknown failure");
            callback(ResultCode::Unknown.as_i32());
        }
    }
}

impl std::fmt::Debug for AppCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCompletion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::events::{ShellEvent, ShellEventQueue};

    #[test]
    fn test_complete_fires_once() {
        let (tx, rx) = mpsc::channel();
        let completion = AppCompletion::new(move |r| tx.send(r).unwrap());
        completion.complete(7);
        assert_eq!(rx.recv().unwrap(), 7);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_on_shell_thread_runs_when_dispatched() {
        let (events, queue) = ShellEventQueue::new();
        let (tx, rx) = mpsc::channel();
        let completion = AppCompletion::on_shell_thread(&events, move |r| {
            tx.send((r, std::thread::current().id())).unwrap();
        });

        std::thread::spawn(move || completion.complete(4)).join().unwrap();
        assert!(rx.try_recv().is_err());

        match queue.next_timeout(Duration::from_secs(1)) {
            Some(ShellEvent::Task(task)) => task(),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(rx.recv().unwrap(), (4, std::thread::current().id()));
    }

    #[test]
    fn test_drop_reports_unknown() {
        let (tx, rx) = mpsc::channel();
        drop(AppCompletion::new(move |r| tx.send(r).unwrap()));
        assert_eq!(rx.recv().unwrap(), ResultCode::Unknown.as_i32());
        assert!(rx.recv().is_err());
    }
}
