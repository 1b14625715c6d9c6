//! Service trait and the worker-side runtime

use crate::protocol::{ControlMessage, WorkerReport};
use crate::stats;
use crate::types::WorkerId;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Exit code of a worker that drained cleanly.
pub const EXIT_OK: i32 = 0;
/// Exit code of a worker that hit an unrecoverable fault.
pub const EXIT_FAULT: i32 = 1;

/// The request-serving part of a worker.
///
/// `serve` runs until the service is done. It should watch
/// [`WorkerContext::shutdown_requested`], stop accepting new work when it
/// resolves, finish in-flight work and return `Ok(())`. Returning an error
/// is fatal for the worker process.
#[async_trait]
pub trait Service: Send + 'static {
    /// The type of error this service can fail with
    type Error: std::error::Error + Send + Sync + 'static;

    /// Serve requests until shutdown or failure.
    async fn serve(&mut self, ctx: WorkerContext) -> Result<(), Self::Error>;
}

/// What a running service can see of its worker.
#[derive(Clone)]
pub struct WorkerContext {
    id: WorkerId,
    reports: mpsc::UnboundedSender<WorkerReport>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerContext {
    /// The supervisor-assigned id of this worker.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Tells the supervisor the worker bound its listening socket.
    pub fn listening(&self, address: SocketAddr) {
        let _ = self.reports.send(WorkerReport::Listening {
            address: address.to_string(),
        });
    }

    /// Returns true once a shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when the supervisor asks this worker to shut down.
    pub async fn shutdown_requested(&self) {
        let mut shutdown = self.shutdown.clone();
        // An error means the runtime is gone, which is a shutdown too.
        let _ = shutdown.wait_for(|requested| *requested).await;
    }
}

/// The transport between a worker and its supervisor.
pub struct WorkerLink {
    /// Control messages from the supervisor. Closing it counts as shutdown.
    pub control: mpsc::UnboundedReceiver<ControlMessage>,
    /// Reports to the supervisor.
    pub reports: mpsc::UnboundedSender<WorkerReport>,
}

/// Drives `service` against `link` and returns the worker's exit code.
///
/// Reports `online` first, answers health checks out-of-band and turns a
/// `shutdown` message into [`WorkerContext::shutdown_requested`].
pub async fn run_worker<S: Service>(id: WorkerId, mut service: S, link: WorkerLink) -> i32 {
    let started_at = Instant::now();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let WorkerLink {
        mut control,
        reports,
    } = link;

    let ctx = WorkerContext {
        id,
        reports: reports.clone(),
        shutdown: shutdown_rx,
    };

    let _ = reports.send(WorkerReport::Online);
    slog::debug!(slog_scope::logger(), "worker started"; "worker" => %id);

    let mut serve = service.serve(ctx);
    let mut control_open = true;

    loop {
        tokio::select! {
            result = &mut serve => {
                return match result {
                    Ok(()) => {
                        slog::debug!(slog_scope::logger(), "worker stopped"; "worker" => %id);
                        EXIT_OK
                    }
                    Err(err) => {
                        slog::error!(slog_scope::logger(), "worker failed";
                            "worker" => %id,
                            "error" => %err
                        );
                        EXIT_FAULT
                    }
                };
            }
            message = control.recv(), if control_open => match message {
                Some(ControlMessage::HealthCheck) => {
                    let _ = reports.send(WorkerReport::Health {
                        pid: std::process::id(),
                        uptime_secs: started_at.elapsed().as_secs(),
                        max_rss_kib: stats::max_rss_kib(),
                    });
                }
                Some(ControlMessage::Shutdown) => {
                    slog::info!(slog_scope::logger(), "shutdown requested"; "worker" => %id);
                    let _ = shutdown_tx.send(true);
                }
                None => {
                    slog::warn!(slog_scope::logger(), "control channel closed, shutting down";
                        "worker" => %id
                    );
                    control_open = false;
                    let _ = shutdown_tx.send(true);
                }
            },
        }
    }
}

/// Binds a listener with `SO_REUSEPORT` so every worker in the pool can
/// accept on the same port and the kernel spreads connections across them.
pub fn bind_reuse_port(address: SocketAddr) -> io::Result<TcpListener> {
    use nix::sys::socket::{
        self, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage, sockopt,
    };
    use std::os::fd::AsRawFd;

    let family = if address.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };

    let fd = socket::socket(family, SockType::Stream, SockFlag::empty(), None)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    socket::setsockopt(&fd, sockopt::ReusePort, &true)?;
    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(address))?;
    socket::listen(&fd, Backlog::new(1024)?)?;

    let listener = std::net::TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}
