//! Supervisor handle - public API for interacting with a running supervisor

use super::error::ClusterError;
use super::runtime::{SupervisorCommand, SupervisorRuntime};
use crate::cluster::Role;
use crate::config::ClusterConfig;
use crate::launcher::Launcher;
use crate::stats::{ClusterStats, WorkerCounts};
use crate::types::{ScaleOutcome, WorkerEvent, WorkerId, WorkerInfo};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Lifecycle events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 1024;

/// Handle used to interact with a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    control_tx: mpsc::UnboundedSender<SupervisorCommand>,
    observers: broadcast::Sender<WorkerEvent>,
    started_at: Instant,
}

impl SupervisorHandle {
    /// Starts a supervisor that forks the configured number of workers
    /// through `launcher` and keeps the pool at that size.
    pub fn start(config: ClusterConfig, launcher: impl Launcher) -> Result<Self, ClusterError> {
        Self::start_observed(config, launcher).map(|(handle, _)| handle)
    }

    /// Like [`start`](Self::start), also returning a lifecycle event stream
    /// subscribed before the first worker is forked.
    pub fn start_observed(
        config: ClusterConfig,
        launcher: impl Launcher,
    ) -> Result<(Self, broadcast::Receiver<WorkerEvent>), ClusterError> {
        config.validate()?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (observers, events) = broadcast::channel(EVENT_CAPACITY);
        let runtime =
            SupervisorRuntime::new(config, Arc::new(launcher), control_rx, observers.clone());

        tokio::spawn(runtime.run());

        let handle = Self {
            control_tx,
            observers,
            started_at: Instant::now(),
        };
        Ok((handle, events))
    }

    /// Forks one additional worker and returns its record.
    ///
    /// The target size is unchanged, so the next scale call decides whether
    /// the extra worker stays.
    pub async fn fork(&self) -> Result<WorkerInfo, ClusterError> {
        self.request(|respond_to| SupervisorCommand::Fork { respond_to })
            .await?
    }

    /// Resizes the pool to `target` workers.
    ///
    /// Growing forks the difference immediately. Shrinking sends a terminate
    /// signal to the lowest-id connected workers; they are not replaced.
    pub async fn scale_workers(&self, target: usize) -> Result<ScaleOutcome, ClusterError> {
        self.request(|respond_to| SupervisorCommand::Scale { target, respond_to })
            .await?
    }

    /// Terminates every connected worker. Each exit is replaced like a crash,
    /// so the pool refills with fresh ids.
    pub async fn restart_all(&self) -> Result<Vec<WorkerId>, ClusterError> {
        self.request(|respond_to| SupervisorCommand::RestartAll { respond_to })
            .await?
    }

    /// Sends `shutdown` to every connected worker and waits until all of
    /// them have disconnected.
    ///
    /// Safe to call repeatedly or concurrently: later calls join the same
    /// wait, and a call after the supervisor stopped returns immediately.
    pub async fn shutdown_gracefully(&self) -> Result<(), ClusterError> {
        let (respond_to, done) = oneshot::channel();
        if self
            .control_tx
            .send(SupervisorCommand::Shutdown { respond_to })
            .is_err()
        {
            return Ok(());
        }
        // A dropped responder means the runtime already finished draining.
        let _ = done.await;
        Ok(())
    }

    /// Returns a snapshot of every registered worker, in id order.
    pub async fn which_workers(&self) -> Result<Vec<WorkerInfo>, ClusterError> {
        self.request(|respond_to| SupervisorCommand::WhichWorkers { respond_to })
            .await
    }

    /// Returns registered, target and connected worker counts.
    pub async fn worker_counts(&self) -> Result<WorkerCounts, ClusterError> {
        self.request(|respond_to| SupervisorCommand::Counts { respond_to })
            .await
    }

    /// Master-only statistics snapshot.
    ///
    /// Returns `None` when called from a worker process or once the
    /// supervisor has stopped.
    pub async fn stats(&self) -> Option<ClusterStats> {
        if !matches!(Role::current(), Ok(Role::Master)) {
            return None;
        }
        let workers = self.worker_counts().await.ok()?;
        Some(ClusterStats::collect(self.started_at, workers))
    }

    /// Subscribes to lifecycle events as the supervisor observes them.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.observers.subscribe()
    }

    /// Returns true while the supervisor runtime is alive.
    pub fn is_running(&self) -> bool {
        !self.control_tx.is_closed()
    }

    /// Resolves once the supervisor runtime has stopped.
    pub async fn stopped(&self) {
        self.control_tx.closed().await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, ClusterError> {
        let (respond_to, response) = oneshot::channel();
        self.control_tx
            .send(command(respond_to))
            .map_err(|_| ClusterError::Stopped)?;
        response.await.map_err(|_| ClusterError::Stopped)
    }
}
