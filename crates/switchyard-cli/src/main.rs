//! Switchyard - application shell.
//!
//! Loads the layered configuration, applies command-line overrides, starts
//! every URL given on the command line and runs until all of them exit.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod overrides;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use switchyard_config::Config;
use switchyard_shell::{AppUrl, ShellContext};
use switchyard_telemetry::{LogConfig, LogFormat};
use tracing::info;

/// Switchyard - run applications connected by message pipes
#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to an additional configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL that `app:` URLs resolve against
    #[arg(long)]
    origin: Option<String>,

    /// Run native applications in child processes
    #[arg(long)]
    enable_multiprocess: bool,

    /// Path of the child process binary
    #[arg(long)]
    child_path: Option<PathBuf>,

    /// URL mappings, e.g. `app:a=file:///opt/a.app,app:b=app:c`
    #[arg(long, value_name = "FROM=TO,...")]
    url_mappings: Option<String>,

    /// Startup arguments for one URL: the URL followed by its arguments,
    /// separated by spaces. May be repeated.
    #[arg(long, value_name = "URL ARGS")]
    args_for: Vec<String>,

    /// Log format: pretty, compact or json
    #[arg(long)]
    log_format: Option<String>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Applications to run
    #[arg(required = true, value_name = "URL")]
    urls: Vec<String>,
}

fn log_config(config: &Config, verbose: u8) -> Result<LogConfig> {
    let format: LogFormat = config.logging.format.parse()?;
    let mut log_config = LogConfig::new(config.logging.level.clone())
        .with_format(format)
        .with_verbosity(verbose);
    for directive in &config.logging.directives {
        log_config = log_config.with_directive(directive.clone());
    }
    Ok(log_config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let resolved = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let mut config = resolved.config;
    overrides::apply(&mut config, &cli)?;
    config.validate().context("invalid configuration")?;

    if let Err(e) = switchyard_telemetry::setup_logging(&log_config(&config, cli.verbose)?) {
        eprintln!("Failed to initialize logging: {e}");
    }
    info!(files = ?resolved.loaded_files, "configuration loaded");

    let urls = cli
        .urls
        .iter()
        .map(String::as_str)
        .map(AppUrl::parse)
        .collect::<Result<Vec<_>, _>>()?;

    let mut shell = ShellContext::from_config(&config)?;
    for url in &urls {
        shell.run(url);
    }
    shell.run_event_loop();
    shell.shutdown();
    info!("all applications exited");
    Ok(())
}
