//! Channel identifiers.

use std::sync::atomic::{AtomicI64, Ordering};

/// Identifies a channel within one process.
///
/// Ids are negative so they never collide with positive, externally issued
/// process identifiers, and they are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(i64);

impl ChannelId {
    /// The raw value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically decreasing channel ids.
#[derive(Debug)]
pub(crate) struct ChannelIdAllocator {
    next: AtomicI64,
}

impl ChannelIdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicI64::new(-1),
        }
    }

    pub(crate) fn allocate(&self) -> ChannelId {
        ChannelId(self.next.fetch_sub(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_negative_and_monotonic() {
        let ids = ChannelIdAllocator::new();
        let a = ids.allocate();
        let b = ids.allocate();
        assert_eq!(a.as_i64(), -1);
        assert_eq!(b.as_i64(), -2);
        assert!(b < a);
    }

    #[test]
    fn test_concurrent_allocation_is_collision_free() {
        let ids = Arc::new(ChannelIdAllocator::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..500).map(|_| ids.allocate()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for t in threads {
            for id in t.join().unwrap() {
                assert!(id.as_i64() < 0);
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
