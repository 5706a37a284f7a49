//! The bootstrap control protocol spoken between a [`ChildProcessHost`] and
//! the child it launched, over the bootstrap channel's primary pipe.
//!
//! [`ChildProcessHost`]: crate::ChildProcessHost

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Control messages in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Host to child: load and run an application. Attachment: the
    /// application request pipe.
    StartApp {
        /// Path of the code unit.
        app_path: PathBuf,
        /// Delete `app_path` once the code unit has been unloaded.
        clean_app_path: bool,
    },
    /// Host to child: terminate now with `exit_code`.
    ExitNow {
        /// Process exit status.
        exit_code: i32,
    },
    /// Child to host: `StartApp` was received.
    AppStarted,
    /// Child to host: the application's entry point returned.
    AppCompleted {
        /// Result code of the application.
        result: i32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_json_shape() {
        let json = serde_json::to_string(&ControlMessage::ExitNow { exit_code: 42 }).unwrap();
        assert_eq!(json, r#"{"type":"ExitNow","exit_code":42}"#);
        let back: ControlMessage = serde_json::from_str(r#"{"type":"AppStarted"}"#).unwrap();
        assert_eq!(back, ControlMessage::AppStarted);
    }
}
