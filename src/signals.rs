//! Termination signal handling for the master process

use crate::supervisor::SupervisorHandle;
use std::io;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;

/// Listens for SIGINT and SIGTERM.
///
/// Creating it installs the handlers, so from then on neither signal kills
/// the process by default.
pub struct Termination {
    interrupt: Signal,
    terminate: Signal,
}

impl Termination {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the next SIGINT or SIGTERM and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

/// Drives a graceful shutdown of `handle` on the first SIGINT or SIGTERM.
///
/// Both signals lead to the same, single shutdown sequence; repeats are
/// swallowed while it runs.
pub fn install_shutdown_handlers(handle: SupervisorHandle) -> io::Result<JoinHandle<()>> {
    let mut termination = Termination::new()?;

    Ok(tokio::spawn(async move {
        let name = termination.recv().await;
        slog::info!(slog_scope::logger(), "received signal, shutting down"; "signal" => name);

        let shutdown = handle.shutdown_gracefully();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                name = termination.recv() => {
                    slog::info!(slog_scope::logger(), "shutdown already in progress"; "signal" => name);
                }
            }
        }
    }))
}
