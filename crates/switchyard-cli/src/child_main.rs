//! `switchyard-child` - hosts one native application for a shell.
//!
//! Launched by the shell with an inherited socket and a connection id; not
//! meant to be started by hand.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::os::fd::RawFd;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use switchyard_channel::{ConnectionId, take_inherited_fd};
use switchyard_shell::{ChildOptions, FATAL_EXIT_CODE, NativeLibraryLoader, run_child};
use switchyard_system::SystemLimits;
use switchyard_telemetry::{LogConfig, LogFormat};
use tracing::error;

/// Switchyard child process.
#[derive(Parser, Debug)]
#[command(name = "switchyard-child")]
#[command(author, version, about = "Switchyard child process (launched by the shell)")]
struct Args {
    /// Connection id to announce to the shell
    #[arg(long)]
    child_connection_id: ConnectionId,

    /// Inherited descriptor of the bootstrap socket
    #[arg(long)]
    platform_channel_fd: RawFd,

    /// Log filter forwarded by the shell
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Maximum number of live handles
    #[arg(long)]
    max_handles: Option<usize>,

    /// Maximum payload size of one message
    #[arg(long)]
    max_message_bytes: Option<usize>,

    /// Maximum number of handles attached to one message
    #[arg(long)]
    max_message_handles: Option<usize>,

    /// Maximum size of one shared buffer
    #[arg(long)]
    max_shared_buffer_bytes: Option<u64>,
}

impl Args {
    /// The shell's limits, with defaults for any it did not forward.
    fn limits(&self) -> SystemLimits {
        let defaults = SystemLimits::default();
        SystemLimits {
            max_handles: self.max_handles.unwrap_or(defaults.max_handles),
            max_message_bytes: self.max_message_bytes.unwrap_or(defaults.max_message_bytes),
            max_message_handles: self
                .max_message_handles
                .unwrap_or(defaults.max_message_handles),
            max_shared_buffer_bytes: self
                .max_shared_buffer_bytes
                .unwrap_or(defaults.max_shared_buffer_bytes),
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let platform_fd =
        take_inherited_fd(args.platform_channel_fd).context("bootstrap descriptor not inherited")?;
    let limits = args.limits();
    let code = run_child(ChildOptions {
        connection_id: args.child_connection_id,
        platform_fd,
        code_loader: Arc::new(NativeLibraryLoader),
        limits,
    })?;
    Ok(code)
}

fn main() {
    let args = Args::parse();

    let log_config = LogConfig::new(args.log_level.clone()).with_format(LogFormat::Compact);
    if let Err(e) = switchyard_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "child failed to start");
            FATAL_EXIT_CODE
        },
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use switchyard_shell::limit_switches;

    use super::*;

    const ID: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_forwarded_limits_are_parsed() {
        let limits = SystemLimits {
            max_handles: 9,
            max_message_bytes: 128,
            max_message_handles: 3,
            max_shared_buffer_bytes: 1024,
        };
        let mut argv = vec![
            "switchyard-child".to_owned(),
            format!("--child-connection-id={ID}"),
            "--platform-channel-fd=3".to_owned(),
        ];
        argv.extend(limit_switches(&limits));

        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.limits(), limits);
    }

    #[test]
    fn test_missing_limits_use_defaults() {
        let args = Args::try_parse_from([
            "switchyard-child",
            "--child-connection-id",
            ID,
            "--platform-channel-fd",
            "3",
        ])
        .unwrap();
        assert_eq!(args.limits(), SystemLimits::default());
        assert_eq!(args.log_level, "info");
    }
}
