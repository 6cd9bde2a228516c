//! `berth logs` — Print a container's logs.

use std::io::Write;

use anyhow::Context;
use berth_common::types::ContainerId;
use berth_stream::client::{LogsOptions, StreamClient};
use clap::Args;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container ID or name.
    pub container: String,

    /// Follow log output.
    #[arg(short, long)]
    pub follow: bool,

    /// Number of lines to show from the end of the logs.
    #[arg(long)]
    pub tail: Option<u64>,

    /// Show timestamps.
    #[arg(short, long)]
    pub timestamps: bool,

    /// Only logs newer than this Unix timestamp.
    #[arg(long)]
    pub since: Option<i64>,

    /// The container was started with a tty.
    #[arg(long)]
    pub tty: bool,
}

/// Executes the `logs` command.
///
/// Container stdout goes to stdout and container stderr to stderr.
///
/// # Errors
///
/// Returns an error if the container is not found or the stream breaks.
pub fn execute(client: &StreamClient, args: &LogsArgs) -> anyhow::Result<()> {
    let options = LogsOptions {
        follow: args.follow,
        tail: args.tail,
        timestamps: args.timestamps,
        since: args.since,
        tty: args.tty,
        ..LogsOptions::new(ContainerId::new(&args.container))
    };

    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr().lock();
    let summary = client
        .logs(&options, &mut stdout, &mut stderr)
        .with_context(|| format!("reading logs for {}", args.container))?;
    stdout.flush()?;

    tracing::debug!(
        stdout = summary.stdout_bytes,
        stderr = summary.stderr_bytes,
        "logs finished"
    );
    Ok(())
}
