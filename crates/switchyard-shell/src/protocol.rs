//! Messages exchanged between the shell and an application over its
//! application pipe, and between applications over service connections.
//!
//! Every message is a JSON document; pipes it refers to travel as
//! attachments, in the order the message's fields describe.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use switchyard_system::{Core, Handle, ReadMessage};

use crate::app_url::AppUrl;
use crate::error::{ShellError, ShellResult};

/// Sent by the shell to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ShellMessage {
    /// First message on every application pipe.
    Initialize {
        /// Identity of the application (query stripped).
        url: AppUrl,
        /// Startup arguments: configured ones followed by query arguments.
        args: Vec<String>,
    },
    /// A new client. Attachments: `services` if present, then
    /// `exposed_services` if present.
    AcceptConnection {
        /// Who is connecting.
        requestor_url: AppUrl,
        /// The URL the request resolved to.
        resolved_url: AppUrl,
        /// Whether a services pipe is attached.
        #[serde(default)]
        has_services: bool,
        /// Whether an exposed-services pipe is attached.
        #[serde(default)]
        has_exposed_services: bool,
    },
}

/// Sent by an application to the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ApplicationMessage {
    /// Connect to another application. Attachments as for
    /// [`ShellMessage::AcceptConnection`].
    ConnectToApplication {
        /// Application to connect to.
        url: AppUrl,
        /// Whether a services pipe is attached.
        #[serde(default)]
        has_services: bool,
        /// Whether an exposed-services pipe is attached.
        #[serde(default)]
        has_exposed_services: bool,
    },
}

/// Sent over a services pipe. Attachment: the pipe to bind to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceMessage {
    /// Bind the attached pipe to the service called `name`.
    ConnectToService {
        /// Service name.
        name: String,
    },
}

/// Optional services pipes of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServicePipes {
    /// Services the requestor wants from the target.
    pub services: Option<Handle>,
    /// Services the requestor offers to the target.
    pub exposed_services: Option<Handle>,
}

impl ServicePipes {
    /// Attachments in wire order.
    #[must_use]
    pub fn handles(&self) -> Vec<Handle> {
        self.services.into_iter().chain(self.exposed_services).collect()
    }

    /// Rebuild from wire attachments.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Protocol`] if the attachment count does not
    /// match the flags.
    pub fn from_handles(
        has_services: bool,
        has_exposed_services: bool,
        handles: &[Handle],
    ) -> ShellResult<Self> {
        let expected = usize::from(has_services).saturating_add(usize::from(has_exposed_services));
        if handles.len() != expected {
            return Err(ShellError::Protocol(format!(
                "expected {expected} attached pipes, got {}",
                handles.len()
            )));
        }
        let mut iter = handles.iter().copied();
        let services = if has_services { iter.next() } else { None };
        let exposed_services = if has_exposed_services { iter.next() } else { None };
        Ok(Self {
            services,
            exposed_services,
        })
    }

    /// Close whichever pipes are present.
    pub fn close(self, core: &Core) {
        for handle in self.handles() {
            let _ = core.close(handle);
        }
    }
}

/// Serialize `message` and write it to `pipe` with `handles` attached.
///
/// # Errors
///
/// Returns [`ShellError::System`] if the write fails; the handles are
/// left untouched in that case.
pub fn write_json<T: Serialize>(
    core: &Core,
    pipe: Handle,
    message: &T,
    handles: &[Handle],
) -> ShellResult<()> {
    let bytes = serde_json::to_vec(message)
        .map_err(|e| ShellError::Protocol(format!("failed to encode message: {e}")))?;
    core.write_message(pipe, bytes, handles)?;
    Ok(())
}

/// Read one message from `pipe` and decode it.
///
/// # Errors
///
/// Returns [`ShellError::System`] with [`switchyard_system::SystemError::ShouldWait`]
/// when nothing is queued, and [`ShellError::Protocol`] if the payload is not
/// a valid message. Attachments of a malformed message are closed.
pub fn read_json<T: DeserializeOwned>(core: &Core, pipe: Handle) -> ShellResult<(T, Vec<Handle>)> {
    let ReadMessage { bytes, handles } = core.read_message(pipe)?;
    match serde_json::from_slice(&bytes) {
        Ok(message) => Ok((message, handles)),
        Err(e) => {
            for handle in handles {
                let _ = core.close(handle);
            }
            Err(ShellError::Protocol(format!("failed to decode message: {e}")))
        },
    }
}
