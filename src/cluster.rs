//! Startup role dispatch.
//!
//! A process decides once, at entry, whether it is the master or a worker.
//! The master runs the supervisor and never serves requests; a worker serves
//! requests and answers control messages. Clustering can also be switched
//! off entirely, in which case the service runs alone in this process.

use crate::admin::AdminServer;
use crate::config::ClusterConfig;
use crate::launcher::{Launcher, ProcessLauncher, stdio_link};
use crate::protocol::{ControlMessage, WorkerReport};
use crate::signals::{self, Termination};
use crate::supervisor::{ClusterError, SupervisorHandle};
use crate::types::WorkerId;
use crate::worker::{EXIT_FAULT, EXIT_OK, Service, WorkerLink, run_worker};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

/// Set by the supervisor on every worker it forks.
pub const WORKER_ID_ENV: &str = "TIDEPOOL_WORKER_ID";

/// The part a process plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Runs the supervisor
    Master,
    /// Serves requests under a supervisor
    Worker(WorkerId),
}

impl Role {
    /// Role of the current process.
    pub fn current() -> Result<Self, ClusterError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Role as described by the variables `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClusterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(WORKER_ID_ENV) {
            None => Ok(Role::Master),
            Some(raw) => raw.parse().map(Role::Worker).map_err(|_| {
                ClusterError::InvalidConfig(format!(
                    "{} must be a worker id, got '{}'",
                    WORKER_ID_ENV, raw
                ))
            }),
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}

/// Runs this process in its role and returns the exit code it should end
/// with.
///
/// `factory` builds the service for a worker (or for the lone process when
/// clustering is disabled). The master re-executes the current binary to
/// fork workers.
pub async fn run<S, F>(config: ClusterConfig, factory: F) -> Result<i32, ClusterError>
where
    S: Service,
    F: Fn(WorkerId) -> S,
{
    if !config.enabled {
        slog::info!(slog_scope::logger(), "clustering disabled, running single process");
        return run_single(factory(WorkerId::SOLO)).await;
    }

    match Role::current()? {
        Role::Master => {
            run_master(config, ProcessLauncher::current_exe()?).await?;
            Ok(EXIT_OK)
        }
        Role::Worker(id) => Ok(run_process_worker(id, factory(id)).await),
    }
}

/// Supervises the pool until a graceful shutdown completes.
pub async fn run_master(config: ClusterConfig, launcher: impl Launcher) -> Result<(), ClusterError> {
    let admin_socket = config.admin_socket.clone();
    let handle = SupervisorHandle::start(config, launcher)?;
    let signal_task = signals::install_shutdown_handlers(handle.clone())?;

    let admin_task = admin_socket.clone().map(|path| {
        let server = AdminServer::new(handle.clone());
        tokio::spawn(async move {
            if let Err(err) = server.listen(&path).await {
                slog::error!(slog_scope::logger(), "admin socket failed"; "error" => %err);
            }
        })
    });

    handle.stopped().await;

    signal_task.abort();
    if let Some(task) = admin_task {
        task.abort();
    }
    if let Some(path) = admin_socket {
        let _ = std::fs::remove_file(path);
    }

    slog::info!(slog_scope::logger(), "master exiting");
    Ok(())
}

/// Runs a forked worker: control messages on stdin, reports on stdout.
///
/// Any panic in the worker is fatal and ends the process with exit code 1,
/// leaving recovery to the supervisor.
pub async fn run_process_worker<S: Service>(id: WorkerId, service: S) -> i32 {
    install_fault_hook(id);

    // Ctrl-C reaches the whole process group; the master drives shutdown.
    let _interrupt = match signal(SignalKind::interrupt()) {
        Ok(interrupt) => Some(interrupt),
        Err(err) => {
            slog::warn!(slog_scope::logger(), "could not mask SIGINT"; "error" => %err);
            None
        }
    };

    run_worker(id, service, stdio_link()).await
}

/// Runs the service alone, shutting it down on SIGINT or SIGTERM.
pub async fn run_single<S: Service>(service: S) -> Result<i32, ClusterError> {
    let mut termination = Termination::new()?;
    let (control_tx, control) = mpsc::unbounded_channel();
    let (reports, mut report_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let name = termination.recv().await;
        slog::info!(slog_scope::logger(), "received signal, shutting down"; "signal" => name);
        let _ = control_tx.send(ControlMessage::Shutdown);
        // Keep the handlers installed until the process exits.
        loop {
            termination.recv().await;
        }
    });

    tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            if let WorkerReport::Listening { address } = report {
                slog::info!(slog_scope::logger(), "listening"; "address" => address);
            }
        }
    });

    Ok(run_worker(WorkerId::SOLO, service, WorkerLink { control, reports }).await)
}

fn install_fault_hook(id: WorkerId) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        slog::crit!(slog_scope::logger(), "uncaught fault, exiting"; "worker" => %id);
        std::process::exit(EXIT_FAULT);
    }));
}
