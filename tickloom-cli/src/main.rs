//! TickLoom entry points
//!
//! `tickloom server` runs one replica under a wall-clock-paced tick driver;
//! `tickloom client` performs a one-shot set or get against a cluster.
//! Exit codes: 0 on success, 2 on configuration errors, 1 when the cluster
//! could not serve the request.

mod client;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Failures surfaced to the shell.
#[derive(Debug, Error)]
pub enum CliError {
    /// Topology file problems; exit code 2.
    #[error("{0}")]
    Config(#[from] tickloom_config::ConfigError),

    /// Bad flag combinations; exit code 2.
    #[error("invalid invocation: {0}")]
    Usage(String),

    /// The cluster could not serve the request; exit code 1.
    #[error("request failed: {0}")]
    Request(String),

    /// Transport or storage failure on this node; exit code 1.
    #[error("{0}")]
    Runtime(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Config(_) | CliError::Usage(_) => 2,
            CliError::Request(_) | CliError::Runtime(_) => 1,
        }
    }
}

#[derive(Parser)]
#[command(name = "tickloom", version, about = "Quorum-replicated register cluster")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one replica.
    Server(ServerArgs),
    /// Run a one-shot client request.
    Client(ClientArgs),
}

#[derive(Args)]
pub struct ServerArgs {
    /// Cluster topology YAML.
    #[arg(long)]
    pub config: PathBuf,

    /// This replica's process id; must appear in the topology.
    #[arg(long)]
    pub id: String,

    /// Data directory for the embedded store.
    #[arg(long)]
    pub data: PathBuf,

    /// Waiting-list timeout, in ticks.
    #[arg(long, default_value_t = 50)]
    pub timeout: u64,

    /// Replica algorithm to run.
    #[arg(long, default_value = "quorum-kv")]
    pub factory: String,
}

#[derive(Args)]
pub struct ClientArgs {
    /// Cluster topology YAML.
    #[arg(long)]
    pub config: PathBuf,

    /// This client's process id.
    #[arg(long)]
    pub id: String,

    /// Comma-separated replica names; the first is the coordinator.
    #[arg(long)]
    pub replicas: String,

    /// Key to write (requires --value).
    #[arg(long)]
    pub set: Option<String>,

    /// Value for --set.
    #[arg(long)]
    pub value: Option<String>,

    /// Key to read.
    #[arg(long)]
    pub get: Option<String>,

    /// Wall-clock deadline for the reply, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub deadline_ms: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Server(args) => server::run(args),
        Command::Client(args) => client::run(args),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}
