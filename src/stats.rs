//! Statistics snapshot for monitoring and admin surfaces

use crate::config::available_cores;
use nix::sys::resource::{UsageWho, getrusage};
use nix::sys::time::TimeValLike;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Worker pool counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    /// Workers currently registered
    pub total: usize,
    /// Target pool size
    pub expected: usize,
    /// Registered workers whose control channel is open
    pub active: usize,
}

/// Resource usage of the master process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterStats {
    pub pid: u32,
    pub uptime_secs: u64,
    /// Peak resident set size
    pub max_rss_kib: u64,
    /// CPU time spent in user mode
    pub user_cpu_micros: u64,
    /// CPU time spent in the kernel
    pub system_cpu_micros: u64,
}

/// Host facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpus: usize,
    pub platform: String,
    pub arch: String,
    pub version: String,
}

impl SystemInfo {
    /// Describes the host this process runs on.
    pub fn current() -> Self {
        Self {
            cpus: available_cores(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Everything an admin endpoint reports about the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub master: MasterStats,
    pub workers: WorkerCounts,
    pub system: SystemInfo,
}

impl ClusterStats {
    pub(crate) fn collect(started_at: Instant, workers: WorkerCounts) -> Self {
        let mut master = MasterStats {
            pid: std::process::id(),
            uptime_secs: started_at.elapsed().as_secs(),
            ..MasterStats::default()
        };

        match getrusage(UsageWho::RUSAGE_SELF) {
            Ok(usage) => {
                master.max_rss_kib = rss_kib(usage.max_rss());
                master.user_cpu_micros = usage.user_time().num_microseconds().max(0) as u64;
                master.system_cpu_micros = usage.system_time().num_microseconds().max(0) as u64;
            }
            Err(err) => {
                slog::debug!(slog_scope::logger(), "getrusage failed"; "error" => %err);
            }
        }

        Self {
            master,
            workers,
            system: SystemInfo::current(),
        }
    }
}

/// Peak resident set size of this process, in KiB. Zero if unavailable.
pub(crate) fn max_rss_kib() -> u64 {
    getrusage(UsageWho::RUSAGE_SELF)
        .map(|usage| rss_kib(usage.max_rss()))
        .unwrap_or(0)
}

// ru_maxrss is bytes on macOS and KiB elsewhere.
#[cfg(target_os = "macos")]
fn rss_kib(raw: nix::libc::c_long) -> u64 {
    raw.max(0) as u64 / 1024
}

#[cfg(not(target_os = "macos"))]
fn rss_kib(raw: nix::libc::c_long) -> u64 {
    raw.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_reports_this_process() {
        let counts = WorkerCounts {
            total: 4,
            expected: 4,
            active: 3,
        };
        let stats = ClusterStats::collect(Instant::now(), counts);

        assert_eq!(stats.master.pid, std::process::id());
        assert_eq!(stats.workers, counts);
        assert!(stats.master.max_rss_kib > 0);
        assert!(stats.system.cpus >= 1);
        assert_eq!(stats.system.platform, std::env::consts::OS);
    }

    #[test]
    fn test_stats_serialize_to_json() {
        let stats = ClusterStats::collect(
            Instant::now(),
            WorkerCounts {
                total: 1,
                expected: 2,
                active: 1,
            },
        );
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["workers"]["expected"], 2);
        assert!(json["system"]["version"].is_string());
    }
}
