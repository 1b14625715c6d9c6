//! Control protocol between the supervisor and its workers.
//!
//! Messages are JSON-serialized and newline-delimited. The supervisor writes
//! [`ControlMessage`]s to a worker's stdin; the worker writes
//! [`WorkerReport`]s to its stdout.

use crate::types::LifecycleEvent;
use serde::{Deserialize, Serialize};

/// In-band message from the supervisor to a worker.
///
/// Encoded as a bare string tag: `"health-check"` or `"shutdown"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Fire-and-forget liveness check
    #[serde(rename = "health-check")]
    HealthCheck,
    /// Stop accepting, finish in-flight work and exit cleanly
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Report from a worker to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    /// The worker process started
    Online,
    /// The worker bound its listening socket
    Listening { address: String },
    /// Reply to a health check
    Health {
        pid: u32,
        uptime_secs: u64,
        max_rss_kib: u64,
    },
}

impl ControlMessage {
    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerReport {
    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl From<WorkerReport> for LifecycleEvent {
    fn from(report: WorkerReport) -> Self {
        match report {
            WorkerReport::Online => LifecycleEvent::Online,
            WorkerReport::Listening { address } => LifecycleEvent::Listening { address },
            WorkerReport::Health {
                pid,
                uptime_secs,
                max_rss_kib,
            } => LifecycleEvent::Health {
                pid,
                uptime_secs,
                max_rss_kib,
            },
        }
    }
}
