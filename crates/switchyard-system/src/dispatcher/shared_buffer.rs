//! Shared memory regions.
//!
//! A region is an anonymous file, so its descriptor can travel to another
//! process over a channel. Access goes through positional reads and writes.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use crate::error::{SystemError, SystemResult};
use crate::sync::lock;

/// A handle-owned view of a shared memory region.
///
/// Duplicates share the same region; closing one does not affect the others.
#[derive(Debug, Clone)]
pub struct SharedBufferDispatcher {
    inner: Arc<BufferInner>,
}

#[derive(Debug)]
struct BufferInner {
    num_bytes: u64,
    region: Mutex<Option<Arc<File>>>,
}

impl SharedBufferDispatcher {
    /// Allocate a zero-filled region of `num_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for an empty region and
    /// [`SystemError::ResourceExhausted`] if the region cannot be allocated.
    pub fn create(num_bytes: u64) -> SystemResult<Self> {
        if num_bytes == 0 {
            return Err(SystemError::invalid("shared buffer size must be non-zero"));
        }
        let file = tempfile::tempfile().map_err(|e| {
            SystemError::ResourceExhausted(format!("failed to allocate shared buffer: {e}"))
        })?;
        file.set_len(num_bytes).map_err(|e| {
            SystemError::ResourceExhausted(format!("failed to size shared buffer: {e}"))
        })?;
        Ok(Self::from_file(file, num_bytes))
    }

    /// Adopt a region received from another process.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] if the descriptor is not a
    /// regular file of at least `num_bytes`.
    pub fn from_fd(fd: OwnedFd, num_bytes: u64) -> SystemResult<Self> {
        let file = File::from(fd);
        let len = file
            .metadata()
            .map_err(|e| SystemError::invalid(format!("not a shared buffer: {e}")))?
            .len();
        if num_bytes == 0 || len < num_bytes {
            return Err(SystemError::invalid(format!(
                "shared buffer is {len} bytes, expected {num_bytes}"
            )));
        }
        Ok(Self::from_file(file, num_bytes))
    }

    fn from_file(file: File, num_bytes: u64) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                num_bytes,
                region: Mutex::new(Some(Arc::new(file))),
            }),
        }
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.inner.num_bytes
    }

    /// A new dispatcher sharing this region.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] if this dispatcher is closed.
    pub fn duplicate(&self) -> SystemResult<Self> {
        let region = self.region()?;
        Ok(Self {
            inner: Arc::new(BufferInner {
                num_bytes: self.inner.num_bytes,
                region: Mutex::new(Some(region)),
            }),
        })
    }

    /// Read `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for out-of-range access or a
    /// closed dispatcher.
    pub fn read_at(&self, offset: u64, len: usize) -> SystemResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut buf = vec![0; len];
        self.region()?
            .read_exact_at(&mut buf, offset)
            .map_err(|e| SystemError::invalid(format!("shared buffer read failed: {e}")))?;
        Ok(buf)
    }

    /// Write `bytes` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for out-of-range access or a
    /// closed dispatcher.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> SystemResult<()> {
        self.check_range(offset, bytes.len())?;
        self.region()?
            .write_all_at(bytes, offset)
            .map_err(|e| SystemError::invalid(format!("shared buffer write failed: {e}")))
    }

    /// A fresh descriptor for the region, for transfer to another process.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] if the dispatcher is closed or
    /// the descriptor cannot be duplicated.
    pub fn to_fd(&self) -> SystemResult<OwnedFd> {
        let file = self
            .region()?
            .try_clone()
            .map_err(|e| SystemError::invalid(format!("failed to duplicate region: {e}")))?;
        Ok(OwnedFd::from(file))
    }

    /// Release this dispatcher's reference to the region.
    pub fn close(&self) {
        lock(&self.inner.region).take();
    }

    /// Whether the dispatcher still refers to its region.
    #[must_use]
    pub fn is_open(&self) -> bool {
        lock(&self.inner.region).is_some()
    }

    fn region(&self) -> SystemResult<Arc<File>> {
        lock(&self.inner.region)
            .clone()
            .ok_or_else(|| SystemError::invalid("shared buffer is closed"))
    }

    fn check_range(&self, offset: u64, len: usize) -> SystemResult<()> {
        let end = u64::try_from(len)
            .ok()
            .and_then(|len| offset.checked_add(len))
            .filter(|end| *end <= self.inner.num_bytes);
        match end {
            Some(_) => Ok(()),
            None => Err(SystemError::invalid(format!(
                "range {offset}+{len} exceeds shared buffer of {} bytes",
                self.inner.num_bytes
            ))),
        }
    }
}
