//! CLI command definitions and dispatch.

pub mod attach;
pub mod events;
pub mod logs;
pub mod stats;

use std::path::PathBuf;

use anyhow::Context;
use berth_common::config::BerthConfig;
use berth_common::constants::{BIN_NAME, CONFIG_PATH_ENV, DAEMON_URL_ENV};
use berth_stream::client::StreamClient;
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, bounded};

/// berth — follow a container daemon's streams.
#[derive(Parser, Debug)]
#[command(name = BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Daemon API base URL; overrides the config file.
    #[arg(long, global = true, env = DAEMON_URL_ENV)]
    pub daemon_url: Option<String>,

    /// Path to a JSON config file.
    #[arg(long, global = true, env = CONFIG_PATH_ENV)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print lifecycle events as JSON lines until interrupted.
    Events(events::EventsArgs),
    /// Show CPU and memory usage of a container.
    Stats(stats::StatsArgs),
    /// Print a container's logs.
    Logs(logs::LogsArgs),
    /// Attach to a running container's output.
    Attach(attach::AttachArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(cli.config.as_deref(), cli.daemon_url)?;
    let client = StreamClient::connect(&config.daemon_url)
        .with_context(|| format!("connecting to {}", config.daemon_url))?;
    tracing::debug!(url = %config.daemon_url, "client ready");

    match cli.command {
        Command::Events(args) => events::execute(&client, &config, &args),
        Command::Stats(args) => stats::execute(&client, &args),
        Command::Logs(args) => logs::execute(&client, &args),
        Command::Attach(args) => attach::execute(&client, &args),
    }
}

/// Loads the config file (defaults when absent) and applies flag overrides.
fn resolve_config(path: Option<&std::path::Path>, daemon_url: Option<String>) -> anyhow::Result<BerthConfig> {
    let mut config = match path {
        Some(path) => BerthConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => BerthConfig::default(),
    };
    if let Some(url) = daemon_url {
        config.daemon_url = url;
    }
    config.validate()?;
    Ok(config)
}

/// Returns a receiver that yields once when the user presses Ctrl+C.
fn interrupt_signal() -> anyhow::Result<Receiver<()>> {
    let (tx, rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;
    Ok(rx)
}
