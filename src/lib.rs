//! Memory access latency as a function of working-set size.
//!
//! A sweep builds a random single-cycle pointer chain per buffer size, pins the measuring thread
//! to a performance or efficiency core, and times dependent loads through the chain. See
//! [`sweep::LatencySweep`] for the entry point.
pub mod affinity;
pub mod chase;
pub mod error;
pub mod params;
pub mod sweep;
pub mod timing;
pub mod topology;

pub use affinity::AffinityOutcome;
pub use error::{Result, SweepError};
pub use params::{CoreClass, SweepEntry, TestParameters};
pub use sweep::{
    CancellationToken, ChaseProbe, LatencyMeasurement, LatencyProbe, LatencySweep, RunReport,
    RunStatus, SweepEvent,
};

/// Convert number of bytes to formatted string
pub fn format_size(bytes: f32) -> String {
    const GB: f32 = 1024.0 * 1024.0 * 1024.0;
    const MB: f32 = 1024.0 * 1024.0;
    const KB: f32 = 1024.0;

    if bytes >= GB {
        format!("{:.2} GiB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes / KB)
    } else {
        format!("{:.2} B", bytes)
    }
}

/// Convert number of bytes to formatted string for fixed-width integer string
pub fn format_size_fixed_int(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;

    if bytes >= GB {
        format!("{:>4} GiB", bytes / GB)
    } else if bytes >= MB {
        format!("{:>4} MiB", bytes / MB)
    } else if bytes >= KB {
        format!("{:>4} KiB", bytes / KB)
    } else {
        format!("{:>4} B", bytes)
    }
}

/// Heuristic cache level for a measured latency on a typical modern desktop
pub fn estimate_level(latency_ns: f64) -> &'static str {
    if latency_ns < 2.0 {
        "L1d"
    } else if latency_ns < 6.0 {
        "L1d/L2"
    } else if latency_ns < 15.0 {
        "L2"
    } else if latency_ns < 50.0 {
        "L3"
    } else {
        "DRAM"
    }
}

/// Latency grew enough over the previous size to suggest a cache level transition
pub fn is_level_jump(prev_latency_ns: f64, latency_ns: f64) -> bool {
    prev_latency_ns > 0.0 && latency_ns > prev_latency_ns * 1.5
}
