//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tidepool::config::{ADMIN_SOCKET_ENV, CLUSTER_WORKERS_ENV};

/// Supervise a pool of worker processes sharing one port.
#[derive(Parser, Debug)]
#[command(name = "tidepool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// More log output (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Less log output (-q for warnings, -qq for errors).
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    pub quiet: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the cluster with the built-in status service.
    Serve(ServeArgs),

    /// Show master and pool statistics.
    Stats(AdminArgs),

    /// List registered workers.
    Workers(AdminArgs),

    /// Resize the worker pool.
    Scale(ScaleArgs),

    /// Replace every worker.
    Restart(AdminArgs),

    /// Drain the pool and stop the master.
    Stop(AdminArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address every worker listens on.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// Number of workers (defaults to one per CPU core).
    #[arg(short, long, env = CLUSTER_WORKERS_ENV)]
    pub workers: Option<usize>,

    /// Run a single process without a supervisor.
    #[arg(long)]
    pub single: bool,

    /// Unix socket for admin commands.
    #[arg(long, env = ADMIN_SOCKET_ENV)]
    pub admin_socket: Option<PathBuf>,

    /// Seconds between health checks.
    #[arg(long, value_name = "SECS")]
    pub health_interval: Option<u64>,

    /// Give up waiting for workers to drain after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub shutdown_timeout: Option<u64>,
}

/// Where to reach a running master.
#[derive(Parser, Debug)]
pub struct AdminArgs {
    /// Admin socket of the master.
    #[arg(long, env = ADMIN_SOCKET_ENV, default_value = "/tmp/tidepool.sock")]
    pub socket: PathBuf,
}

/// Arguments for the scale command.
#[derive(Parser, Debug)]
pub struct ScaleArgs {
    /// Target number of workers.
    pub workers: usize,

    #[command(flatten)]
    pub admin: AdminArgs,
}
