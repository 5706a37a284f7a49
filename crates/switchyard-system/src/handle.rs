//! Generation-checked handle values.

use serde::{Deserialize, Serialize};

/// Process-local identifier for exactly one live dispatcher.
///
/// The upper 32 bits carry the slot generation and the lower 32 bits the
/// slot index. Generations start at 1, so the all-zero value is never issued
/// and a handle to a released slot is rejected instead of aliasing whatever
/// now lives there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The invalid handle.
    pub const INVALID: Self = Self(0);

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(index))
    }

    /// Reconstruct a handle from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Slot index inside the handle table.
    #[must_use]
    pub const fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Slot generation this handle was issued for.
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Whether this is anything other than [`Handle::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index(), self.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing() {
        let h = Handle::new(7, 3);
        assert_eq!(h.index(), 7);
        assert_eq!(h.generation(), 3);
        assert_eq!(Handle::from_raw(h.as_raw()), h);
        assert!(h.is_valid());
    }

    #[test]
    fn test_invalid() {
        assert!(!Handle::INVALID.is_valid());
        assert_ne!(Handle::new(0, 1), Handle::INVALID);
    }

    #[test]
    fn test_display() {
        assert_eq!(Handle::new(12, 2).to_string(), "12#2");
    }
}
