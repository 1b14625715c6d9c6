//! Common types shared by the supervisor, launchers and workers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Supervisor-assigned worker identifier.
///
/// Ids increase monotonically for the lifetime of a supervisor and are never
/// reused: a replacement for a crashed worker always gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Id used by a service running without a supervisor.
    pub const SOLO: WorkerId = WorkerId(0);

    /// Wraps a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(WorkerId)
    }
}

/// Lifecycle state of a worker as observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Process created, not yet ready to serve
    Forked,
    /// Process started and reported in
    Online,
    /// Process bound its share of the listening socket
    Listening,
    /// Asked to leave (shutdown message or terminate signal), or its
    /// control channel closed
    Disconnecting,
    /// Process terminated
    Exited,
}

impl WorkerState {
    /// Returns true if moving from `self` to `next` respects the
    /// fork → online → listening → disconnecting → exited order.
    ///
    /// Re-entering the current state is allowed so that duplicate
    /// notifications are harmless.
    pub fn can_advance(self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (current, next) if current == next => current != Exited,
            (Forked, Online) | (Online, Listening) => true,
            (Forked | Online | Listening, Disconnecting) => true,
            (Forked | Online | Listening | Disconnecting, Exited) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Forked => "forked",
            WorkerState::Online => "online",
            WorkerState::Listening => "listening",
            WorkerState::Disconnecting => "disconnecting",
            WorkerState::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// How a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Exited with a status code
    Code(i32),
    /// Killed by a signal (raw signal number)
    Signal(i32),
}

impl ExitStatus {
    /// Returns true for a clean `0` exit.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Code(code),
            (None, Some(signal)) => ExitStatus::Signal(signal),
            (None, None) => ExitStatus::Code(-1),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {}", code),
            ExitStatus::Signal(raw) => match nix::sys::signal::Signal::try_from(*raw) {
                Ok(signal) => write!(f, "signal {}", signal),
                Err(_) => write!(f, "signal {}", raw),
            },
        }
    }
}

/// A lifecycle transition observed for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// The supervisor created the worker
    Forked,
    /// The worker process started
    Online,
    /// The worker bound its listening socket
    Listening { address: String },
    /// Out-of-band reply to a health check
    Health {
        pid: u32,
        uptime_secs: u64,
        max_rss_kib: u64,
    },
    /// The worker's control channel closed
    Disconnected,
    /// The worker process terminated
    Exited(ExitStatus),
}

/// A lifecycle event tagged with the worker it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub id: WorkerId,
    pub kind: LifecycleEvent,
}

/// Snapshot of one registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Supervisor-assigned id
    pub id: WorkerId,
    /// OS process id, if the launcher has one
    pub pid: Option<u32>,
    /// Current lifecycle state
    pub state: WorkerState,
    /// Whether the control channel is still open
    pub connected: bool,
    /// Address the worker reported listening on
    pub address: Option<String>,
    /// Seconds since the worker was forked
    pub uptime_secs: u64,
}

/// Result of an explicit resize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleOutcome {
    /// Workers forked to grow the pool
    pub forked: Vec<WorkerId>,
    /// Workers sent a terminate signal to shrink the pool
    pub terminated: Vec<WorkerId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_forward_transitions() {
        assert!(WorkerState::Forked.can_advance(WorkerState::Online));
        assert!(WorkerState::Online.can_advance(WorkerState::Listening));
        assert!(WorkerState::Listening.can_advance(WorkerState::Disconnecting));
        assert!(WorkerState::Disconnecting.can_advance(WorkerState::Exited));
        assert!(WorkerState::Forked.can_advance(WorkerState::Exited));
    }

    #[test]
    fn test_state_rejects_out_of_order() {
        assert!(!WorkerState::Forked.can_advance(WorkerState::Listening));
        assert!(!WorkerState::Listening.can_advance(WorkerState::Online));
        assert!(!WorkerState::Exited.can_advance(WorkerState::Online));
        assert!(!WorkerState::Exited.can_advance(WorkerState::Exited));
        assert!(!WorkerState::Disconnecting.can_advance(WorkerState::Listening));
    }

    #[test]
    fn test_state_duplicates_are_harmless() {
        assert!(WorkerState::Online.can_advance(WorkerState::Online));
        assert!(WorkerState::Disconnecting.can_advance(WorkerState::Disconnecting));
    }

    #[test]
    fn test_worker_id_parse_and_display() {
        let id: WorkerId = " 42 ".parse().unwrap();
        assert_eq!(id, WorkerId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<WorkerId>().is_err());
    }

    #[test]
    fn test_exit_status_display() {
        assert_eq!(ExitStatus::Code(1).to_string(), "exit code 1");
        assert_eq!(ExitStatus::Signal(15).to_string(), "signal SIGTERM");
        assert!(ExitStatus::Code(0).is_success());
        assert!(!ExitStatus::Signal(9).is_success());
    }
}
