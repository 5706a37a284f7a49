//! System error types and stable result codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by handle-table and dispatcher operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SystemError {
    /// The handle table (or a per-message limit) is full.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unknown handle, or a handle used at a kind it does not support.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation can never succeed in the current state (usually: peer closed).
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Nothing is available yet; wait and retry.
    #[error("Should wait")]
    ShouldWait,

    /// The handle is in transit inside another write.
    #[error("Handle is busy")]
    Busy,

    /// A wait was cancelled because its handle was closed.
    #[error("Cancelled")]
    Cancelled,

    /// A blocking wait ran out of time.
    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

impl SystemError {
    /// The numeric result code reported across component boundaries.
    #[must_use]
    pub fn code(&self) -> ResultCode {
        match self {
            Self::ResourceExhausted(_) => ResultCode::ResourceExhausted,
            Self::InvalidArgument(_) => ResultCode::InvalidArgument,
            Self::FailedPrecondition(_) => ResultCode::FailedPrecondition,
            Self::ShouldWait => ResultCode::ShouldWait,
            Self::Busy => ResultCode::Busy,
            Self::Cancelled => ResultCode::Cancelled,
            Self::DeadlineExceeded => ResultCode::DeadlineExceeded,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }
}

/// Result type for system operations.
pub type SystemResult<T> = Result<T, SystemError>;

/// Stable numeric result codes.
///
/// Completion callbacks, the bootstrap control protocol and the C entry-point
/// ABI all carry these as plain `i32` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ResultCode {
    /// Success.
    Ok = 0,
    /// Cancelled (the awaited handle was closed).
    Cancelled = 1,
    /// Unknown failure, including abrupt loss of a connection.
    Unknown = 2,
    /// Invalid argument.
    InvalidArgument = 3,
    /// A deadline passed before the operation completed.
    DeadlineExceeded = 4,
    /// The requested entity was not found.
    NotFound = 5,
    /// The entity already exists.
    AlreadyExists = 6,
    /// Permission denied.
    PermissionDenied = 7,
    /// A resource limit was hit.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// Out of range.
    OutOfRange = 11,
    /// Not implemented.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is unavailable (for example: a child process could not be launched).
    Unavailable = 14,
    /// Unrecoverable data loss.
    DataLoss = 15,
    /// The resource is busy.
    Busy = 16,
    /// Retry later.
    ShouldWait = 17,
}

impl ResultCode {
    /// Numeric value of this code.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a raw value back to a known code.
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Busy,
            17 => Self::ShouldWait,
            _ => return None,
        })
    }
}

impl From<ResultCode> for i32 {
    fn from(code: ResultCode) -> Self {
        code.as_i32()
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}({})", self.as_i32())
    }
}
