//! Wrapped OS descriptors.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use crate::error::{SystemError, SystemResult};
use crate::sync::lock;

/// An OS descriptor owned by the handle table.
#[derive(Debug, Clone)]
pub struct PlatformHandleDispatcher {
    fd: Arc<Mutex<Option<OwnedFd>>>,
}

impl PlatformHandleDispatcher {
    /// Wrap a descriptor.
    #[must_use]
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd: Arc::new(Mutex::new(Some(fd))),
        }
    }

    /// Extract the descriptor, leaving the dispatcher empty.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] if it was already extracted or closed.
    pub fn take(&self) -> SystemResult<OwnedFd> {
        lock(&self.fd)
            .take()
            .ok_or_else(|| SystemError::invalid("platform handle already passed or closed"))
    }

    /// Raw descriptor number, for diagnostics.
    #[must_use]
    pub fn raw_fd(&self) -> Option<i32> {
        lock(&self.fd).as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Close the descriptor.
    pub fn close(&self) {
        lock(&self.fd).take();
    }
}
