//! A multi-process worker supervisor.
//!
//! The master process forks a pool of workers that share one listening
//! port, replaces workers that die, checks their health on a fixed
//! interval, resizes the pool on demand and drains it on shutdown. Workers
//! run a [`Service`] and answer the master's control messages.
//!
//! Inspired by pre-fork servers and Erlang/OTP supervision principles.

mod launcher;
mod supervisor;
mod types;
mod worker;

pub mod admin;
pub mod cluster;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod signals;
pub mod stats;
pub mod status;

// Re-export public API
pub use cluster::{Role, WORKER_ID_ENV};
pub use config::ClusterConfig;
pub use launcher::{EventSender, Launcher, ProcessHandle, ProcessLauncher, TaskLauncher};
pub use stats::{ClusterStats, MasterStats, SystemInfo, WorkerCounts};
pub use supervisor::{ClusterError, SupervisorHandle};
pub use types::{
    ExitStatus, LifecycleEvent, ScaleOutcome, WorkerEvent, WorkerId, WorkerInfo, WorkerState,
};
pub use worker::{EXIT_FAULT, EXIT_OK, Service, WorkerContext, WorkerLink, bind_reuse_port, run_worker};
