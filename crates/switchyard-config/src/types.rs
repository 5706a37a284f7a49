//! Configuration structs. Every section has a `Default` matching
//! `defaults.toml`, so partial files deserialize cleanly.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application resolution and process model.
    pub shell: ShellSection,
    /// Handle table and message limits.
    pub system: SystemSection,
    /// Logging level and format.
    pub logging: LoggingSection,
}

/// `[shell]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    /// Base URL that `app:` URLs resolve against. Defaults to the directory
    /// of the running executable.
    pub origin: Option<String>,
    /// Run native applications in child processes.
    pub enable_multiprocess: bool,
    /// Path of the child binary. Defaults to `switchyard-child` next to the
    /// shell executable.
    pub child_path: Option<PathBuf>,
    /// URL rewrites applied before resolution (`from = "to"`).
    pub url_mappings: BTreeMap<String, String>,
    /// Startup arguments handed to applications, keyed by URL.
    pub args_for: BTreeMap<String, Vec<String>>,
}

/// `[system]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    /// Maximum number of live handles.
    pub max_handles: usize,
    /// Maximum payload of one message.
    pub max_message_bytes: usize,
    /// Maximum handles attached to one message.
    pub max_message_handles: usize,
    /// Maximum size of one shared buffer.
    pub max_shared_buffer_bytes: u64,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            max_handles: 1_000_000,
            max_message_bytes: 4_194_304,
            max_message_handles: 10_000,
            max_shared_buffer_bytes: 1_073_741_824,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// `pretty`, `compact` or `json`.
    pub format: String,
    /// Per-crate directives, e.g. `switchyard_channel=debug`.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
