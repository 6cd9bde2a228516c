//! Decoding of streamed container resource-usage snapshots.
//!
//! The stats endpoint writes one JSON document per sampling interval onto
//! a single response body with nothing between documents. Each document is
//! decoded as soon as its closing brace arrives and published to the
//! caller's queue; the body is never buffered as a whole.

use std::collections::BTreeMap;
use std::io::{BufReader, Read};

use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use serde::{Deserialize, Deserializer, Serialize};

use crate::transport::{Method, StreamTransport, check_status};

/// Which stats to request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsOptions {
    /// Container to sample.
    pub id: ContainerId,
    /// Keep sampling until the body closes; `false` requests one snapshot.
    pub stream: bool,
}

impl StatsOptions {
    /// Streaming stats for `id`.
    #[must_use]
    pub const fn streaming(id: ContainerId) -> Self {
        Self { id, stream: true }
    }

    /// A single snapshot for `id`.
    #[must_use]
    pub const fn one_shot(id: ContainerId) -> Self {
        Self { id, stream: false }
    }

    /// Request path for these options.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/containers/{}/stats?stream={}", self.id, self.stream)
    }
}

/// One point-in-time resource-usage measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSnapshot {
    /// Container ID, when the daemon includes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Container name, when the daemon includes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// When this sample was taken.
    pub read: Option<DateTime<Utc>>,
    /// When the previous sample (`precpu_stats`) was taken.
    pub preread: Option<DateTime<Utc>>,
    /// Process counters.
    pub pids_stats: PidsStats,
    /// Per-interface network counters.
    #[serde(deserialize_with = "nullable")]
    pub networks: BTreeMap<String, NetworkStats>,
    /// Memory counters.
    pub memory_stats: MemoryStats,
    /// Block I/O counters.
    pub blkio_stats: BlkioStats,
    /// CPU counters for this sample.
    pub cpu_stats: CpuStats,
    /// CPU counters for the previous sample.
    pub precpu_stats: CpuStats,
}

/// Process counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidsStats {
    /// Number of processes in the container.
    pub current: u64,
    /// Process limit, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Counters for one network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkStats {
    /// Bytes received.
    pub rx_bytes: u64,
    /// Packets received.
    pub rx_packets: u64,
    /// Receive errors.
    pub rx_errors: u64,
    /// Inbound packets dropped.
    pub rx_dropped: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Packets sent.
    pub tx_packets: u64,
    /// Transmit errors.
    pub tx_errors: u64,
    /// Outbound packets dropped.
    pub tx_dropped: u64,
}

/// Memory counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    /// Current usage in bytes.
    pub usage: u64,
    /// Peak usage in bytes (cgroup v1 only).
    pub max_usage: u64,
    /// Limit in bytes.
    pub limit: u64,
    /// Times the limit was hit (cgroup v1 only).
    pub failcnt: u64,
    /// Raw cgroup memory statistics (`cache`, `rss`, `inactive_file`, ...).
    #[serde(deserialize_with = "nullable")]
    pub stats: BTreeMap<String, u64>,
}

/// Block I/O counters, one entry per device and operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioStats {
    /// Bytes transferred.
    #[serde(deserialize_with = "nullable")]
    pub io_service_bytes_recursive: Vec<BlkioEntry>,
    /// I/O operations issued.
    #[serde(deserialize_with = "nullable")]
    pub io_serviced_recursive: Vec<BlkioEntry>,
    /// Operations queued.
    #[serde(deserialize_with = "nullable")]
    pub io_queue_recursive: Vec<BlkioEntry>,
    /// Time spent servicing operations.
    #[serde(deserialize_with = "nullable")]
    pub io_service_time_recursive: Vec<BlkioEntry>,
    /// Time operations spent waiting.
    #[serde(deserialize_with = "nullable")]
    pub io_wait_time_recursive: Vec<BlkioEntry>,
    /// Operations merged.
    #[serde(deserialize_with = "nullable")]
    pub io_merged_recursive: Vec<BlkioEntry>,
    /// Device time used.
    #[serde(deserialize_with = "nullable")]
    pub io_time_recursive: Vec<BlkioEntry>,
    /// Sectors transferred.
    #[serde(deserialize_with = "nullable")]
    pub sectors_recursive: Vec<BlkioEntry>,
}

/// One block I/O counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioEntry {
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
    /// Operation (`Read`, `Write`, `Sync`, `Async`, `Total`).
    pub op: String,
    /// Counter value.
    pub value: u64,
}

impl BlkioStats {
    /// Sums `io_service_bytes_recursive` entries for one operation
    /// (`read` or `write`, case-insensitive).
    #[must_use]
    pub fn service_bytes(&self, op: &str) -> u64 {
        self.io_service_bytes_recursive
            .iter()
            .filter(|e| e.op.eq_ignore_ascii_case(op))
            .map(|e| e.value)
            .sum()
    }
}

/// CPU counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    /// Container CPU time.
    pub cpu_usage: CpuUsage,
    /// Host CPU time, in nanoseconds.
    pub system_cpu_usage: u64,
    /// Number of CPUs online.
    pub online_cpus: u32,
    /// CFS throttling counters.
    pub throttling_data: ThrottlingData,
}

/// Container CPU time, in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuUsage {
    /// Total CPU time consumed.
    pub total_usage: u64,
    /// Per-CPU usage (cgroup v1 only).
    #[serde(deserialize_with = "nullable")]
    pub percpu_usage: Vec<u64>,
    /// Time spent in kernel mode.
    pub usage_in_kernelmode: u64,
    /// Time spent in user mode.
    pub usage_in_usermode: u64,
}

/// CFS throttling counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingData {
    /// Enforcement periods elapsed.
    pub periods: u64,
    /// Periods in which the container was throttled.
    pub throttled_periods: u64,
    /// Total throttled time, in nanoseconds.
    pub throttled_time: u64,
}

/// Accepts `null` wherever the daemon may omit a collection.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Streams stats for a container into `output`.
///
/// Returns when the body ends (for example because the container was
/// removed), when `cancel` receives a message or is disconnected, when the
/// consumer drops its receiver, or on the first error. `output` is
/// consumed, so the queue closes exactly once on every exit path provided
/// the caller holds no other sender clone.
///
/// Cancellation is checked between documents; a read already blocked on
/// the network finishes first.
///
/// # Errors
///
/// Returns [`BerthError::NotFound`] if the container does not exist, the
/// transport error if the stream cannot be opened, or a decode error for
/// the first malformed document.
pub fn stats(
    transport: &dyn StreamTransport,
    options: &StatsOptions,
    output: Sender<StatsSnapshot>,
    cancel: &Receiver<()>,
) -> Result<()> {
    if is_cancelled(cancel) {
        return Ok(());
    }
    let path = options.path();
    tracing::debug!(id = %options.id, %path, "opening stats stream");
    let response = transport.open_stream(Method::Get, &path, None)?;
    let body = check_status(response, "container", options.id.as_str())?;

    let limit = (!options.stream).then_some(1);
    let delivered = decode_into(body, &output, cancel, limit)?;
    tracing::debug!(id = %options.id, delivered, "stats stream finished");
    Ok(())
}

/// Decodes back-to-back snapshots from `reader` and sends each to `output`.
///
/// Returns how many snapshots were delivered.
///
/// # Errors
///
/// Returns the first decode or read error.
pub fn decode_into<R: Read>(
    reader: R,
    output: &Sender<StatsSnapshot>,
    cancel: &Receiver<()>,
    limit: Option<usize>,
) -> Result<usize> {
    let mut documents =
        serde_json::Deserializer::from_reader(BufReader::new(reader)).into_iter::<StatsSnapshot>();
    let mut delivered = 0;

    while limit.is_none_or(|max| delivered < max) {
        if is_cancelled(cancel) {
            tracing::debug!(delivered, "stats stream cancelled");
            break;
        }
        let snapshot = match documents.next() {
            None => break,
            Some(Ok(snapshot)) => snapshot,
            Some(Err(e)) if e.is_io() => {
                return Err(BerthError::Transport {
                    message: format!("stats stream read failed: {e}"),
                });
            }
            Some(Err(e)) => return Err(e.into()),
        };

        select! {
            send(output, snapshot) -> sent => {
                if sent.is_err() {
                    tracing::debug!(delivered, "stats consumer went away");
                    break;
                }
            }
            recv(cancel) -> _ => break,
        }
        delivered += 1;
    }
    Ok(delivered)
}

fn is_cancelled(cancel: &Receiver<()>) -> bool {
    !matches!(cancel.try_recv(), Err(TryRecvError::Empty))
}
