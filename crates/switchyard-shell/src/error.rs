use std::io;
use std::path::PathBuf;

use switchyard_channel::ChannelError;
use switchyard_system::{ResultCode, SystemError};
use thiserror::Error;

/// Errors raised by the shell, loaders and runners.
#[derive(Debug, Error)]
pub enum ShellError {
    /// A URL could not be parsed.
    #[error("Invalid URL {url:?}: {source}")]
    InvalidUrl {
        /// The offending text.
        url: String,
        /// Parser error.
        #[source]
        source: url::ParseError,
    },

    /// A URL cannot be mapped to a local path.
    #[error("URL {0} does not name a local file")]
    NotAFile(String),

    /// The code unit does not exist.
    #[error("Application not found at {0}")]
    AppNotFound(PathBuf),

    /// A code unit exists but could not be loaded.
    #[error("Failed to load {path}: {message}")]
    LoadFailed {
        /// Path of the code unit.
        path: PathBuf,
        /// Loader error.
        message: String,
    },

    /// A message on an application or control pipe was malformed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A thread could not be spawned or joined.
    #[error("Thread error: {0}")]
    Thread(String),

    /// Handle-level failure.
    #[error(transparent)]
    System(#[from] SystemError),

    /// Channel-level failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ShellError {
    /// The result code reported when this error ends an application.
    #[must_use]
    pub fn code(&self) -> ResultCode {
        match self {
            Self::InvalidUrl { .. } | Self::NotAFile(_) => ResultCode::InvalidArgument,
            Self::AppNotFound(_) => ResultCode::NotFound,
            Self::LoadFailed { .. } | Self::Protocol(_) => ResultCode::Internal,
            Self::Thread(_) => ResultCode::ResourceExhausted,
            Self::System(e) => e.code(),
            Self::Channel(_) | Self::Io(_) => ResultCode::Unknown,
        }
    }
}

/// Result type for shell operations.
pub type ShellResult<T> = Result<T, ShellError>;
