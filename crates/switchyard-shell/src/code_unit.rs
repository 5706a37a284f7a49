//! The seam between runners and the code they execute.

use std::path::Path;
use std::sync::Arc;

use switchyard_system::{Core, Handle};

use crate::error::ShellResult;

/// What to do with a code unit's file once it has been unloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Leave the file alone.
    #[default]
    KeepAppPath,
    /// Delete the file after the code unit has been unloaded. Used for
    /// transient copies.
    DeleteAppPath,
}

impl CleanupPolicy {
    /// `true` maps to [`CleanupPolicy::DeleteAppPath`].
    #[must_use]
    pub fn from_delete_flag(delete: bool) -> Self {
        if delete {
            Self::DeleteAppPath
        } else {
            Self::KeepAppPath
        }
    }

    /// Whether the file is deleted.
    #[must_use]
    pub fn deletes(self) -> bool {
        self == Self::DeleteAppPath
    }

    /// Apply the policy to `path`.
    pub(crate) fn apply(self, path: &Path) {
        if !self.deletes() {
            return;
        }
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete application file");
        }
    }
}

/// Loaded application code.
///
/// Dropping the last reference unloads it, so runners keep one until every
/// thread that ran the code has been joined.
pub trait CodeUnit: Send + Sync {
    /// Run the entry point with the application request pipe and return its
    /// result code. Blocks until the application finishes.
    fn run(&self, core: &Arc<Core>, application_request: Handle) -> i32;
}

/// Loads code units from files.
pub trait CodeUnitLoader: Send + Sync {
    /// Load the code unit at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ShellError::AppNotFound`] if `path` does not exist and
    /// [`crate::ShellError::LoadFailed`] if it cannot be loaded.
    fn load(&self, path: &Path) -> ShellResult<Arc<dyn CodeUnit>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_policy_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.app");
        std::fs::write(&path, b"x").unwrap();

        CleanupPolicy::KeepAppPath.apply(&path);
        assert!(path.exists());
        CleanupPolicy::from_delete_flag(true).apply(&path);
        assert!(!path.exists());
    }
}
