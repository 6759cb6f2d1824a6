//! Warren unified CLI.
//!
//! The single-binary container orchestrator.
//!
//! # Quick Start
//!
//! ```bash
//! # Start a one-manager cluster
//! warren cluster init
//!
//! # Mint a worker token (new terminal)
//! warren cluster join-token --role worker
//!
//! # Join a worker
//! warren cluster join --token <TOKEN> --manager 10.0.0.1:7421
//!
//! # Run something
//! warren service create --name web --image nginx:latest --replicas 3
//! ```
//!
//! Exit codes: 0 success, 1 usage error, 2 connection/authentication
//! error, 3 remote validation error, 4 not-leader with no leader
//! available.

mod commands;
mod output;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{ClusterCommands, NodeCommands, SecretCommands, ServiceCommands, VolumeCommands};

/// Warren - containers, orchestrated, in one binary.
#[derive(Parser)]
#[command(name = "warren")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Manager RPC address.
    #[arg(short, long, global = true, default_value = "127.0.0.1:7421")]
    manager: String,

    /// Project directory holding warren.toml.
    #[arg(long, global = true)]
    project_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster lifecycle: init, join, tokens, info.
    #[command(subcommand)]
    Cluster(ClusterCommands),

    /// Service management.
    #[command(subcommand)]
    Service(ServiceCommands),

    /// Node management.
    #[command(subcommand)]
    Node(NodeCommands),

    /// Secret management.
    #[command(subcommand)]
    Secret(SecretCommands),

    /// Volume management.
    #[command(subcommand)]
    Volume(VolumeCommands),

    /// Apply a declarative manifest (upsert services/secrets/volumes).
    Apply {
        /// Manifest file (.toml or .json).
        #[arg(short, long)]
        file: std::path::PathBuf,
    },
}

fn main() {
    // clap exits 2 on parse errors by default; the contract here is 1.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            let code = if error.use_stderr() { 1 } else { 0 };
            std::process::exit(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("WARREN_LOG").unwrap_or_else(|_| {
            EnvFilter::new("warn,warren_manager=info,warren_worker=info,warren_log=info")
        }))
        .with_target(false)
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let result = runtime.block_on(run(cli));
    match result {
        Ok(()) => {}
        Err(error) => {
            eprintln!("Error: {error:#}");
            std::process::exit(commands::exit_code(&error));
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = commands::Context::new(cli.manager, cli.project_dir)?;
    match cli.command {
        Commands::Cluster(cmd) => commands::cluster::run(ctx, cmd).await,
        Commands::Service(cmd) => commands::service::run(ctx, cmd).await,
        Commands::Node(cmd) => commands::node::run(ctx, cmd).await,
        Commands::Secret(cmd) => commands::secret::run(ctx, cmd).await,
        Commands::Volume(cmd) => commands::volume::run(ctx, cmd).await,
        Commands::Apply { file } => commands::apply::run(ctx, file).await,
    }
}
