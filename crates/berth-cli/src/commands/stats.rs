//! `berth stats` — Show CPU and memory usage of a container.

use std::io::Write;
use std::thread;

use anyhow::Context;
use berth_common::types::ContainerId;
use berth_stream::client::StreamClient;
use berth_stream::stats::{StatsOptions, StatsSnapshot};
use clap::Args;
use crossbeam_channel::{bounded, select};

use crate::output::{cpu_percent, format_bytes, memory_percent};

/// Arguments for the `stats` command.
#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Container ID or name.
    pub container: String,

    /// Print a single sample and exit.
    #[arg(long)]
    pub no_stream: bool,
}

/// Executes the `stats` command.
///
/// Prints one line per snapshot until the stream ends or Ctrl+C.
///
/// # Errors
///
/// Returns an error if the container is not found or the stream breaks.
pub fn execute(client: &StreamClient, args: &StatsArgs) -> anyhow::Result<()> {
    let id = ContainerId::new(&args.container);
    let options = if args.no_stream {
        StatsOptions::one_shot(id)
    } else {
        StatsOptions::streaming(id)
    };
    let interrupted = super::interrupt_signal()?;
    let (cancel_tx, cancel_rx) = bounded::<()>(1);
    let (snap_tx, snap_rx) = bounded::<StatsSnapshot>(1);

    let decoder = {
        let client = client.clone();
        thread::Builder::new()
            .name("berth-stats".into())
            .spawn(move || client.stats(&options, snap_tx, &cancel_rx))
            .context("spawning stats reader")?
    };

    let mut stdout = std::io::stdout().lock();
    writeln!(
        stdout,
        "{:<8} {:>8} {:>24} {:>8} {:>6}",
        "NAME", "CPU %", "MEM USAGE / LIMIT", "MEM %", "PIDS"
    )?;
    let mut previous: Option<StatsSnapshot> = None;
    loop {
        select! {
            recv(snap_rx) -> snap => {
                let Ok(snap) = snap else { break };
                writeln!(stdout, "{}", render(&args.container, &snap, previous.as_ref()))?;
                previous = Some(snap);
            }
            recv(interrupted) -> _ => {
                let _ = cancel_tx.try_send(());
                break;
            }
        }
    }
    drop(snap_rx);

    decoder
        .join()
        .map_err(|_| anyhow::anyhow!("stats reader panicked"))?
        .with_context(|| format!("reading stats for {}", args.container))
}

fn render(name: &str, snap: &StatsSnapshot, previous: Option<&StatsSnapshot>) -> String {
    // A first sample may arrive without the daemon's own previous reading.
    let baseline = match previous {
        Some(prev) if snap.precpu_stats.system_cpu_usage == 0 => &prev.cpu_stats,
        _ => &snap.precpu_stats,
    };
    let mem = &snap.memory_stats;
    let usage = format!("{} / {}", format_bytes(mem.usage), format_bytes(mem.limit));
    let short: String = name.chars().take(8).collect();
    format!(
        "{:<8} {:>7.2}% {:>24} {:>7.2}% {:>6}",
        short,
        cpu_percent(&snap.cpu_stats, baseline),
        usage,
        memory_percent(mem.usage, mem.limit),
        snap.pids_stats.current
    )
}
