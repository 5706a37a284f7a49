//! Readiness signals.

use bitflags::bitflags;

bitflags! {
    /// Readiness conditions a dispatcher can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Signals: u32 {
        /// At least one message is queued for reading.
        const READABLE = 0b001;
        /// The peer is open, so writes can be delivered.
        const WRITABLE = 0b010;
        /// The peer endpoint has been closed.
        const PEER_CLOSED = 0b100;
    }
}

/// Signals currently satisfied, and signals that could still become satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalsState {
    /// Signals that hold right now.
    pub satisfied: Signals,
    /// Signals that hold now or may hold in the future.
    pub satisfiable: Signals,
}

impl SignalsState {
    /// State of a dispatcher that never changes readiness.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            satisfied: Signals::empty(),
            satisfiable: Signals::empty(),
        }
    }

    /// Whether any of `signals` is satisfied.
    #[must_use]
    pub fn satisfies(&self, signals: Signals) -> bool {
        self.satisfied.intersects(signals)
    }

    /// Whether none of `signals` can ever become satisfied.
    #[must_use]
    pub fn unsatisfiable(&self, signals: Signals) -> bool {
        !self.satisfiable.intersects(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfies_any() {
        let state = SignalsState {
            satisfied: Signals::WRITABLE,
            satisfiable: Signals::all(),
        };
        assert!(state.satisfies(Signals::READABLE | Signals::WRITABLE));
        assert!(!state.satisfies(Signals::READABLE));
        assert!(!state.unsatisfiable(Signals::READABLE));
    }

    #[test]
    fn test_never() {
        assert!(SignalsState::never().unsatisfiable(Signals::all()));
    }
}
