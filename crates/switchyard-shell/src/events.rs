//! The shell thread's event queue.
//!
//! Every other thread reaches the shell thread by posting here.

use std::sync::mpsc;
use std::time::Duration;

use tracing::debug;

use crate::manager::AppId;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Work for the shell thread.
pub enum ShellEvent {
    /// Run a closure on the shell thread.
    Task(Task),
    /// An application pipe became readable or its peer closed.
    ApplicationSignaled(AppId),
    /// Stop the event loop.
    Quit,
}

impl std::fmt::Debug for ShellEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task(_) => f.write_str("Task"),
            Self::ApplicationSignaled(id) => {
                f.debug_tuple("ApplicationSignaled").field(id).finish()
            },
            Self::Quit => f.write_str("Quit"),
        }
    }
}

/// Cloneable sender half of the shell event queue.
#[derive(Debug, Clone)]
pub struct ShellEventSender {
    sender: mpsc::Sender<ShellEvent>,
}

impl ShellEventSender {
    /// Queue `event`. Events posted after the shell stopped are dropped.
    pub fn send(&self, event: ShellEvent) {
        if self.sender.send(event).is_err() {
            debug!("shell event queue closed; dropping event");
        }
    }

    /// Queue `task` to run on the shell thread.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.send(ShellEvent::Task(Box::new(task)));
    }
}

/// Receiving half, owned by the shell thread.
#[derive(Debug)]
pub struct ShellEventQueue {
    receiver: mpsc::Receiver<ShellEvent>,
}

impl ShellEventQueue {
    /// Create a queue and its sender.
    #[must_use]
    pub fn new() -> (ShellEventSender, Self) {
        let (sender, receiver) = mpsc::channel();
        (ShellEventSender { sender }, Self { receiver })
    }

    /// Next event, waiting up to `timeout`.
    #[must_use]
    pub fn next_timeout(&self, timeout: Duration) -> Option<ShellEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Next event if one is queued.
    #[must_use]
    pub fn try_next(&self) -> Option<ShellEvent> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let (sender, queue) = ShellEventQueue::new();
        sender.post(|| {});
        sender.send(ShellEvent::Quit);
        assert!(matches!(queue.try_next(), Some(ShellEvent::Task(_))));
        assert!(matches!(queue.try_next(), Some(ShellEvent::Quit)));
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_posted_task_runs_when_dispatched() {
        let (sender, queue) = ShellEventQueue::new();
        let (tx, rx) = mpsc::channel();
        sender.post(move || tx.send(5).unwrap());
        match queue.next_timeout(Duration::from_secs(1)) {
            Some(ShellEvent::Task(task)) => task(),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(rx.recv().unwrap(), 5);
    }
}
