//! Built-in status service served by `tidepool serve`
//!
//! Answers every TCP connection with a tiny HTTP response naming the worker
//! that accepted it, which makes port sharing across the pool observable.

use crate::types::WorkerId;
use crate::worker::{Service, WorkerContext, bind_reuse_port};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;

/// How long a connection may take to send its request before it is
/// answered anyway.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Replies `{"worker": <id>, "pid": <pid>}` to every connection.
#[derive(Debug, Clone)]
pub struct StatusService {
    address: SocketAddr,
}

impl StatusService {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }
}

#[async_trait]
impl Service for StatusService {
    type Error = io::Error;

    async fn serve(&mut self, ctx: WorkerContext) -> Result<(), Self::Error> {
        let listener = bind_reuse_port(self.address)?;
        ctx.listening(listener.local_addr()?);

        let id = ctx.id();
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = ctx.shutdown_requested() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    in_flight.spawn(async move {
                        if let Err(err) = respond(stream, id).await {
                            slog::debug!(slog_scope::logger(), "status request failed";
                                "peer" => %peer,
                                "error" => %err
                            );
                        }
                    });
                }
                // Reap finished connections so the set stays small.
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        drop(listener);
        slog::debug!(slog_scope::logger(), "draining status connections";
            "worker" => %id,
            "in_flight" => in_flight.len()
        );
        while in_flight.join_next().await.is_some() {}
        Ok(())
    }
}

async fn respond(mut stream: TcpStream, id: WorkerId) -> io::Result<()> {
    let mut request = [0u8; 1024];
    let _ = tokio::time::timeout(REQUEST_TIMEOUT, stream.read(&mut request)).await;

    let body = serde_json::json!({ "worker": id, "pid": std::process::id() }).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
