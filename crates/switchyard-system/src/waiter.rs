//! One-shot readiness waiters.

use crate::error::{SystemError, SystemResult};
use crate::signals::{Signals, SignalsState};

/// Callback invoked once when an awaited condition resolves.
///
/// Receives `Ok(())` when the signals became satisfied,
/// [`SystemError::FailedPrecondition`] when they can never be satisfied and
/// [`SystemError::Cancelled`] when the handle was closed or transferred.
pub type WaitCallback = Box<dyn FnOnce(SystemResult<()>) + Send + 'static>;

/// Identifies a registered waiter so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(pub(crate) u64);

struct Waiter {
    id: WaiterId,
    signals: Signals,
    callback: WaitCallback,
}

/// A waiter whose outcome is known and that must be fired outside any lock.
pub(crate) struct ReadyWaiter {
    callback: WaitCallback,
    result: SystemResult<()>,
}

impl ReadyWaiter {
    pub(crate) fn new(callback: WaitCallback, result: SystemResult<()>) -> Self {
        Self { callback, result }
    }

    pub(crate) fn fire(self) {
        (self.callback)(self.result);
    }
}

/// Outcome of registering a waiter on a dispatcher.
pub(crate) enum Registration {
    /// Registered; fires on a later state transition.
    Pending,
    /// Already resolved; the caller decides where to run it.
    Ready(ReadyWaiter),
}

#[derive(Default)]
pub(crate) struct WaiterList {
    waiters: Vec<Waiter>,
}

impl WaiterList {
    /// Register a waiter, or hand it back if `state` already resolves it.
    pub(crate) fn register(
        &mut self,
        id: WaiterId,
        signals: Signals,
        callback: WaitCallback,
        state: SignalsState,
    ) -> Registration {
        match outcome(signals, state) {
            Some(result) => Registration::Ready(ReadyWaiter::new(callback, result)),
            None => {
                self.waiters.push(Waiter {
                    id,
                    signals,
                    callback,
                });
                Registration::Pending
            },
        }
    }

    pub(crate) fn remove(&mut self, id: WaiterId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        self.waiters.len() != before
    }

    /// Detach every waiter that `state` resolves.
    pub(crate) fn take_ready(&mut self, state: SignalsState) -> Vec<ReadyWaiter> {
        let mut ready = Vec::new();
        let mut pending = Vec::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            match outcome(waiter.signals, state) {
                Some(result) => ready.push(ReadyWaiter::new(waiter.callback, result)),
                None => pending.push(waiter),
            }
        }
        self.waiters = pending;
        ready
    }

    /// Detach every waiter with a cancellation result.
    pub(crate) fn cancel_all(&mut self) -> Vec<ReadyWaiter> {
        self.waiters
            .drain(..)
            .map(|w| ReadyWaiter::new(w.callback, Err(SystemError::Cancelled)))
            .collect()
    }
}

fn outcome(signals: Signals, state: SignalsState) -> Option<SystemResult<()>> {
    if state.satisfies(signals) {
        Some(Ok(()))
    } else if state.unsatisfiable(signals) {
        Some(Err(SystemError::precondition("signals can never be satisfied")))
    } else {
        None
    }
}

pub(crate) fn fire_all(ready: Vec<ReadyWaiter>) {
    for waiter in ready {
        waiter.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<SystemResult<()>>>>, impl Fn() -> WaitCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move || -> WaitCallback {
                let log = Arc::clone(&log);
                Box::new(move |r| log.lock().unwrap().push(r))
            }
        };
        (log, make)
    }

    fn open_empty() -> SignalsState {
        SignalsState {
            satisfied: Signals::WRITABLE,
            satisfiable: Signals::all(),
        }
    }

    #[test]
    fn test_register_pending_then_ready() {
        let (log, make) = recorder();
        let mut list = WaiterList::default();
        let reg = list.register(WaiterId(1), Signals::READABLE, make(), open_empty());
        assert!(matches!(reg, Registration::Pending));

        assert!(list.take_ready(open_empty()).is_empty());

        let readable = SignalsState {
            satisfied: Signals::READABLE | Signals::WRITABLE,
            satisfiable: Signals::all(),
        };
        fire_all(list.take_ready(readable));
        assert_eq!(log.lock().unwrap().as_slice(), &[Ok(())]);
    }

    #[test]
    fn test_register_already_satisfied() {
        let (_log, make) = recorder();
        let mut list = WaiterList::default();
        let reg = list.register(WaiterId(1), Signals::WRITABLE, make(), open_empty());
        assert!(matches!(reg, Registration::Ready(_)));
    }

    #[test]
    fn test_unsatisfiable_and_cancel() {
        let (log, make) = recorder();
        let mut list = WaiterList::default();
        let _ = list.register(WaiterId(1), Signals::READABLE, make(), open_empty());
        let _ = list.register(WaiterId(2), Signals::PEER_CLOSED, make(), open_empty());

        let closed = SignalsState {
            satisfied: Signals::PEER_CLOSED,
            satisfiable: Signals::PEER_CLOSED,
        };
        fire_all(list.take_ready(closed));
        let results = log.lock().unwrap().clone();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(SystemError::FailedPrecondition(_))));
        assert_eq!(results[1], Ok(()));

        let _ = list.register(WaiterId(3), Signals::READABLE, make(), open_empty());
        fire_all(list.cancel_all());
        assert_eq!(log.lock().unwrap().last(), Some(&Err(SystemError::Cancelled)));
    }

    #[test]
    fn test_remove() {
        let (_log, make) = recorder();
        let mut list = WaiterList::default();
        let _ = list.register(WaiterId(7), Signals::READABLE, make(), open_empty());
        assert!(list.remove(WaiterId(7)));
        assert!(!list.remove(WaiterId(7)));
    }
}
