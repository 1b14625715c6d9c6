//! Admin control over a Unix domain socket
//!
//! Lets operators inspect and steer a running master from another process.
//! Each connection carries one command and one response, both encoded as
//! length-prefixed bincode frames.

use crate::stats::ClusterStats;
use crate::supervisor::SupervisorHandle;
use crate::types::{ScaleOutcome, WorkerId, WorkerInfo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Largest frame either side will accept.
const MAX_FRAME_LEN: usize = 10_000_000;

/// Commands accepted on the admin socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCommand {
    /// Master and pool statistics
    Stats,
    /// Snapshot of every registered worker
    Workers,
    /// Resize the pool
    Scale { target: usize },
    /// Replace every worker
    RestartAll,
    /// Drain the pool and stop the master
    Shutdown,
}

/// Responses from the admin socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminResponse {
    Ok,
    Stats(ClusterStats),
    Workers(Vec<WorkerInfo>),
    Scaled(ScaleOutcome),
    Restarted(Vec<WorkerId>),
    Error(String),
}

/// Serves admin commands against a supervisor
pub struct AdminServer {
    handle: SupervisorHandle,
}

impl AdminServer {
    pub fn new(handle: SupervisorHandle) -> Self {
        Self { handle }
    }

    /// Binds `path` and serves connections until the task is dropped.
    ///
    /// A stale socket file at `path` is replaced.
    pub async fn listen(self, path: impl AsRef<Path>) -> Result<(), AdminError> {
        let path = path.as_ref();
        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path)?;
        slog::info!(slog_scope::logger(), "admin socket listening"; "path" => %path.display());

        loop {
            let (mut stream, _) = listener.accept().await?;
            let handle = self.handle.clone();

            tokio::spawn(async move {
                if let Err(err) = handle_connection(&mut stream, handle).await {
                    slog::warn!(slog_scope::logger(), "admin connection failed"; "error" => %err);
                }
            });
        }
    }
}

async fn handle_connection<S>(stream: &mut S, handle: SupervisorHandle) -> Result<(), AdminError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let command: AdminCommand = receive_message(stream).await?;
    slog::debug!(slog_scope::logger(), "admin command"; "command" => ?command);
    let response = process_command(command, &handle).await;
    send_message(stream, &response).await
}

async fn process_command(command: AdminCommand, handle: &SupervisorHandle) -> AdminResponse {
    match command {
        AdminCommand::Stats => match handle.stats().await {
            Some(stats) => AdminResponse::Stats(stats),
            None => AdminResponse::Error("statistics unavailable".to_string()),
        },
        AdminCommand::Workers => match handle.which_workers().await {
            Ok(workers) => AdminResponse::Workers(workers),
            Err(err) => AdminResponse::Error(err.to_string()),
        },
        AdminCommand::Scale { target } => match handle.scale_workers(target).await {
            Ok(outcome) => AdminResponse::Scaled(outcome),
            Err(err) => AdminResponse::Error(err.to_string()),
        },
        AdminCommand::RestartAll => match handle.restart_all().await {
            Ok(retired) => AdminResponse::Restarted(retired),
            Err(err) => AdminResponse::Error(err.to_string()),
        },
        AdminCommand::Shutdown => {
            // Answer first; the drain can outlive the client's patience.
            let handle = handle.clone();
            tokio::spawn(async move {
                let _ = handle.shutdown_gracefully().await;
            });
            AdminResponse::Ok
        }
    }
}

/// Client side of the admin socket
#[derive(Debug, Clone)]
pub struct AdminClient {
    path: PathBuf,
}

impl AdminClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Sends one command and waits for its response.
    pub async fn send_command(&self, command: AdminCommand) -> Result<AdminResponse, AdminError> {
        let mut stream = UnixStream::connect(&self.path).await?;
        send_message(&mut stream, &command).await?;
        receive_message(&mut stream).await
    }

    pub async fn stats(&self) -> Result<ClusterStats, AdminError> {
        match self.send_command(AdminCommand::Stats).await? {
            AdminResponse::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, AdminError> {
        match self.send_command(AdminCommand::Workers).await? {
            AdminResponse::Workers(workers) => Ok(workers),
            other => Err(unexpected(other)),
        }
    }

    pub async fn scale(&self, target: usize) -> Result<ScaleOutcome, AdminError> {
        match self.send_command(AdminCommand::Scale { target }).await? {
            AdminResponse::Scaled(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub async fn restart_all(&self) -> Result<Vec<WorkerId>, AdminError> {
        match self.send_command(AdminCommand::RestartAll).await? {
            AdminResponse::Restarted(retired) => Ok(retired),
            other => Err(unexpected(other)),
        }
    }

    /// Asks the master to shut down. Returns once the request is accepted,
    /// not when the drain completes.
    pub async fn shutdown(&self) -> Result<(), AdminError> {
        match self.send_command(AdminCommand::Shutdown).await? {
            AdminResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: AdminResponse) -> AdminError {
    match response {
        AdminResponse::Error(message) => AdminError::Remote(message),
        _ => AdminError::UnexpectedResponse,
    }
}

/// Writes a length-prefixed bincode frame.
async fn send_message<S, T>(stream: &mut S, msg: &T) -> Result<(), AdminError>
where
    S: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let encoded = bincode::serialize(msg)?;
    if encoded.len() > MAX_FRAME_LEN {
        return Err(AdminError::MessageTooLarge(encoded.len()));
    }

    stream.write_all(&(encoded.len() as u32).to_be_bytes()).await?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads a length-prefixed bincode frame.
async fn receive_message<S, T>(stream: &mut S) -> Result<T, AdminError>
where
    S: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(AdminError::MessageTooLarge(len));
    }

    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(bincode::deserialize(&buffer)?)
}

/// Errors raised on either side of the admin socket
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("admin socket i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("admin frame could not be encoded: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("master rejected command: {0}")]
    Remote(String),

    #[error("unexpected response from master")]
    UnexpectedResponse,

    #[error("admin frame too large: {0} bytes")]
    MessageTooLarge(usize),
}
