//! Convenience facade over one transport.
//!
//! Builds the stream endpoints' paths and hands each opened body to the
//! matching consumer: the demultiplexer for logs/attach, the stats
//! decoder, or a [`Monitor`] for events.

use std::io::Write;
use std::sync::Arc;

use berth_common::config::MonitorConfig;
use berth_common::error::Result;
use berth_common::types::ContainerId;
use crossbeam_channel::{Receiver, Sender};

use crate::demux::{DemuxSummary, copy_output};
use crate::monitor::Monitor;
use crate::stats::{StatsOptions, StatsSnapshot};
use crate::transport::{HttpTransport, Method, StreamTransport, check_status};

/// Options for reading a container's logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogsOptions {
    /// Container to read.
    pub id: ContainerId,
    /// Keep the body open and stream new output.
    pub follow: bool,
    /// Include stdout.
    pub stdout: bool,
    /// Include stderr.
    pub stderr: bool,
    /// Prefix each line with its timestamp.
    pub timestamps: bool,
    /// Only the last `n` lines; `None` means all.
    pub tail: Option<u64>,
    /// Only output newer than this Unix timestamp.
    pub since: Option<i64>,
    /// The container runs with a tty, so the body is not multiplexed.
    pub tty: bool,
}

impl LogsOptions {
    /// Stdout and stderr, all lines, no follow.
    #[must_use]
    pub const fn new(id: ContainerId) -> Self {
        Self {
            id,
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: None,
            since: None,
            tty: false,
        }
    }

    /// Request path for these options.
    #[must_use]
    pub fn path(&self) -> String {
        let mut query = vec![
            format!("follow={}", self.follow),
            format!("stdout={}", self.stdout),
            format!("stderr={}", self.stderr),
            format!("timestamps={}", self.timestamps),
        ];
        query.push(self.tail.map_or_else(|| "tail=all".to_string(), |n| format!("tail={n}")));
        if let Some(since) = self.since {
            query.push(format!("since={since}"));
        }
        format!("/containers/{}/logs?{}", self.id, query.join("&"))
    }
}

/// Options for attaching to a running container's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    /// Container to attach to.
    pub id: ContainerId,
    /// Replay output produced before the attach.
    pub logs: bool,
    /// Keep streaming live output.
    pub stream: bool,
    /// Include stdout.
    pub stdout: bool,
    /// Include stderr.
    pub stderr: bool,
    /// The container runs with a tty, so the body is not multiplexed.
    pub tty: bool,
}

impl AttachOptions {
    /// Live stdout and stderr without replay.
    #[must_use]
    pub const fn new(id: ContainerId) -> Self {
        Self {
            id,
            logs: false,
            stream: true,
            stdout: true,
            stderr: true,
            tty: false,
        }
    }

    /// Request path for these options.
    #[must_use]
    pub fn path(&self) -> String {
        format!(
            "/containers/{}/attach?logs={}&stream={}&stdout={}&stderr={}",
            self.id, self.logs, self.stream, self.stdout, self.stderr
        )
    }
}

/// Entry point for every stream kind on one daemon.
#[derive(Clone)]
pub struct StreamClient {
    transport: Arc<dyn StreamTransport>,
}

impl StreamClient {
    /// Wraps an existing transport.
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self { transport }
    }

    /// Connects to a daemon over HTTP.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be built.
    pub fn connect(daemon_url: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new(daemon_url)?)))
    }

    /// Creates an event monitor sharing this client's transport.
    #[must_use]
    pub fn monitor(&self, config: MonitorConfig) -> Monitor {
        Monitor::new(Arc::clone(&self.transport), config)
    }

    /// Streams stats snapshots; see [`crate::stats::stats`].
    ///
    /// # Errors
    ///
    /// Returns the single terminal error of the stream, if any.
    pub fn stats(
        &self,
        options: &StatsOptions,
        output: Sender<StatsSnapshot>,
        cancel: &Receiver<()>,
    ) -> Result<()> {
        crate::stats::stats(self.transport.as_ref(), options, output, cancel)
    }

    /// Copies a container's logs to the given sinks.
    ///
    /// # Errors
    ///
    /// Returns [`berth_common::error::BerthError::NotFound`] for an unknown
    /// container, or the first transport, framing, or sink error.
    pub fn logs<O, E>(&self, options: &LogsOptions, stdout: &mut O, stderr: &mut E) -> Result<DemuxSummary>
    where
        O: Write + ?Sized,
        E: Write + ?Sized,
    {
        let response = self.transport.open_stream(Method::Get, &options.path(), None)?;
        let body = check_status(response, "container", options.id.as_str())?;
        tracing::debug!(id = %options.id, follow = options.follow, "streaming logs");
        copy_output(body, options.tty, stdout, stderr)
    }

    /// Attaches to a container's output and copies it to the given sinks
    /// until the container exits or the connection closes.
    ///
    /// # Errors
    ///
    /// Returns [`berth_common::error::BerthError::NotFound`] for an unknown
    /// container, or the first transport, framing, or sink error.
    pub fn attach<O, E>(&self, options: &AttachOptions, stdout: &mut O, stderr: &mut E) -> Result<DemuxSummary>
    where
        O: Write + ?Sized,
        E: Write + ?Sized,
    {
        let response = self.transport.open_stream(Method::Post, &options.path(), None)?;
        let body = check_status(response, "container", options.id.as_str())?;
        tracing::debug!(id = %options.id, tty = options.tty, "attached");
        copy_output(body, options.tty, stdout, stderr)
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_path_defaults_to_all_lines() {
        let opts = LogsOptions::new(ContainerId::new("abc"));
        assert_eq!(
            opts.path(),
            "/containers/abc/logs?follow=false&stdout=true&stderr=true&timestamps=false&tail=all"
        );
    }

    #[test]
    fn logs_path_carries_tail_and_since() {
        let opts = LogsOptions {
            follow: true,
            tail: Some(10),
            since: Some(1_700_000_000),
            ..LogsOptions::new(ContainerId::new("abc"))
        };
        let path = opts.path();
        assert!(path.contains("follow=true"));
        assert!(path.contains("tail=10"));
        assert!(path.ends_with("since=1700000000"));
    }

    #[test]
    fn attach_path_streams_both_outputs() {
        let opts = AttachOptions::new(ContainerId::new("abc"));
        assert_eq!(
            opts.path(),
            "/containers/abc/attach?logs=false&stream=true&stdout=true&stderr=true"
        );
    }
}
