//! Supervisor errors

use crate::types::WorkerId;

/// Errors returned by supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The launcher could not create a worker process
    #[error("failed to fork worker {id}: {source}")]
    ForkFailed {
        id: WorkerId,
        #[source]
        source: std::io::Error,
    },
    /// A terminate signal could not be delivered
    #[error("failed to signal worker {id}: {source}")]
    SignalFailed {
        id: WorkerId,
        #[source]
        source: nix::Error,
    },
    /// The worker's control channel is closed
    #[error("worker {0} is disconnected")]
    Disconnected(WorkerId),
    /// The supervisor is draining and refuses pool changes
    #[error("supervisor is shutting down")]
    ShuttingDown,
    /// The supervisor runtime is no longer running
    #[error("supervisor has stopped")]
    Stopped,
    /// A configuration value cannot be honored
    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),
    /// I/O error outside of worker creation
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
