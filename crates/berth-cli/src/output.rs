//! Formatted output helpers for CLI commands.
//!
//! Human-readable byte counts and the usage percentages shown by
//! `berth stats`.

use berth_stream::stats::CpuStats;

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// CPU usage between two readings as a percentage of one core, scaled by
/// the number of online CPUs.
///
/// Returns 0 when either delta is not positive (first sample, counter
/// reset).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn cpu_percent(current: &CpuStats, previous: &CpuStats) -> f64 {
    let cpu_delta = current
        .cpu_usage
        .total_usage
        .saturating_sub(previous.cpu_usage.total_usage);
    let system_delta = current
        .system_cpu_usage
        .saturating_sub(previous.system_cpu_usage);
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }
    let cpus = match current.online_cpus {
        0 => current.cpu_usage.percpu_usage.len().max(1) as f64,
        n => f64::from(n),
    };
    cpu_delta as f64 / system_delta as f64 * cpus * 100.0
}

/// Memory usage as a percentage of the limit; 0 when no limit is reported.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}
