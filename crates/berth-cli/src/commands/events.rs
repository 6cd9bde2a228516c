//! `berth events` — Print lifecycle events as JSON lines.

use std::io::Write;
use std::time::Duration;

use berth_common::config::BerthConfig;
use berth_common::types::SubjectKey;
use berth_stream::client::StreamClient;
use berth_stream::event::Event;
use clap::Args;
use crossbeam_channel::RecvTimeoutError;

/// Arguments for the `events` command.
#[derive(Args, Debug)]
pub struct EventsArgs {
    /// Only events for this container or image ID.
    #[arg(long)]
    pub id: Option<String>,

    /// Only these statuses (repeatable); all statuses when omitted.
    #[arg(long)]
    pub status: Vec<String>,
}

/// Executes the `events` command.
///
/// Subscribes to the daemon's event stream and prints each matching
/// event until Ctrl+C or until the monitor gives up reconnecting.
///
/// # Errors
///
/// Returns an error if the event stream cannot be opened.
pub fn execute(client: &StreamClient, config: &BerthConfig, args: &EventsArgs) -> anyhow::Result<()> {
    let interrupted = super::interrupt_signal()?;
    let monitor = client.monitor(config.monitor.clone());
    let key = args.id.clone().map_or(SubjectKey::All, SubjectKey::subject);
    let subscription = monitor
        .subscribe(key)
        .map_err(|e| anyhow::anyhow!("subscribing to events: {e}"))?;

    if args.status.is_empty() {
        subscription.handle_all(print_event);
    } else {
        for status in &args.status {
            subscription.handle(status.clone(), print_event);
        }
    }

    loop {
        match interrupted.recv_timeout(Duration::from_millis(250)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) if !subscription.is_active() => {
                tracing::warn!("event stream ended");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    subscription.cancel()?;
    monitor.close()?;
    let dropped = monitor.dropped_events();
    if dropped > 0 {
        tracing::warn!(dropped, "events dropped because output fell behind");
    }
    Ok(())
}

fn print_event(event: &Event) {
    let line = match serde_json::to_string(event) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "unprintable event");
            return;
        }
    };
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{line}") {
        tracing::debug!(error = %e, "stdout closed");
    }
}
