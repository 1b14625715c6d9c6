//! Registry entry for one live worker

use crate::launcher::ProcessHandle;
use crate::protocol::ControlMessage;
use crate::supervisor::ClusterError;
use crate::types::{WorkerId, WorkerInfo, WorkerState};
use std::time::Instant;

/// One forked, not-yet-reaped worker. Pid and connection state are read
/// from the process handle, never copied.
pub(crate) struct WorkerRecord {
    id: WorkerId,
    process: Box<dyn ProcessHandle>,
    state: WorkerState,
    address: Option<String>,
    forked_at: Instant,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, process: Box<dyn ProcessHandle>) -> Self {
        Self {
            id,
            process,
            state: WorkerState::Forked,
            address: None,
            forked_at: Instant::now(),
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.process.is_connected()
    }

    #[inline]
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn send(&self, message: ControlMessage) -> Result<(), ClusterError> {
        self.process.send(message)
    }

    pub fn terminate(&self) -> Result<(), ClusterError> {
        self.process.terminate()
    }

    /// Moves to `next` if the transition is legal. Out-of-order transitions
    /// are logged and leave the state untouched.
    pub fn advance(&mut self, next: WorkerState) -> bool {
        if self.state.can_advance(next) {
            self.state = next;
            true
        } else {
            slog::warn!(slog_scope::logger(), "ignoring out-of-order worker transition";
                "worker" => %self.id,
                "from" => %self.state,
                "to" => %next
            );
            false
        }
    }

    pub fn set_address(&mut self, address: String) {
        self.address = Some(address);
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            pid: self.pid(),
            state: self.state,
            connected: self.is_connected(),
            address: self.address.clone(),
            uptime_secs: self.forked_at.elapsed().as_secs(),
        }
    }
}
