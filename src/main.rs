mod cli;

use clap::Parser;
use cli::{AdminArgs, Cli, Commands, ServeArgs};
use serde::Serialize;
use std::time::Duration;
use tidepool::admin::{AdminClient, AdminError};
use tidepool::status::StatusService;
use tidepool::{ClusterConfig, ClusterError, logging};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error("could not render output: {0}")]
    Output(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let guard = logging::init(logging::level_from_verbosity(cli.verbose, cli.quiet));

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            slog::error!(slog_scope::logger(), "{}", err);
            1
        }
    };

    // Flush the async drain before exiting.
    drop(guard);
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Stats(admin) => print(&client(&admin).stats().await?),
        Commands::Workers(admin) => print(&client(&admin).workers().await?),
        Commands::Scale(args) => print(&client(&args.admin).scale(args.workers).await?),
        Commands::Restart(admin) => print(&client(&admin).restart_all().await?),
        Commands::Stop(admin) => {
            client(&admin).shutdown().await?;
            slog::info!(slog_scope::logger(), "shutdown requested");
            Ok(0)
        }
    }
}

async fn cmd_serve(args: ServeArgs) -> Result<i32, CliError> {
    let mut config = ClusterConfig::from_env()?;
    if args.single {
        config = config.with_enabled(false);
    }
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(path) = args.admin_socket {
        config = config.with_admin_socket(path);
    }
    if let Some(secs) = args.health_interval {
        config = config.with_health_check_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = args.shutdown_timeout {
        config = config.with_shutdown_timeout(Duration::from_secs(secs));
    }

    let addr = args.addr;
    Ok(tidepool::cluster::run(config, move |_| StatusService::new(addr)).await?)
}

fn client(admin: &AdminArgs) -> AdminClient {
    AdminClient::new(&admin.socket)
}

fn print<T: Serialize>(value: &T) -> Result<i32, CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(0)
}
