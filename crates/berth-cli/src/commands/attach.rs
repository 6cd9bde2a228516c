//! `berth attach` — Stream a running container's output.

use anyhow::Context;
use berth_common::types::ContainerId;
use berth_stream::client::{AttachOptions, StreamClient};
use clap::Args;

use crate::output::format_bytes;

/// Arguments for the `attach` command.
#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Container ID or name.
    pub container: String,

    /// Replay output produced before attaching.
    #[arg(long)]
    pub logs: bool,

    /// The container was started with a tty.
    #[arg(long)]
    pub tty: bool,
}

/// Executes the `attach` command.
///
/// Copies output until the container exits or the connection closes.
///
/// # Errors
///
/// Returns an error if the container is not found or the stream breaks.
pub fn execute(client: &StreamClient, args: &AttachArgs) -> anyhow::Result<()> {
    let options = AttachOptions {
        logs: args.logs,
        tty: args.tty,
        ..AttachOptions::new(ContainerId::new(&args.container))
    };

    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr().lock();
    let summary = client
        .attach(&options, &mut stdout, &mut stderr)
        .with_context(|| format!("attaching to {}", args.container))?;

    tracing::info!(
        stdout = %format_bytes(summary.stdout_bytes),
        stderr = %format_bytes(summary.stderr_bytes),
        skipped = summary.skipped_frames,
        "detached"
    );
    Ok(())
}
