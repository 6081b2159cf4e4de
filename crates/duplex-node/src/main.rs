//! Duplex node: entry point.
//!
//! Subcommands: `init` writes a default config, `start` runs the node.

mod api;
mod chain;
mod commands;
mod config;
mod node;
mod routing;
mod state;
mod storage;
mod transport;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::NodeConfig;
use node::DuplexNode;

/// Duplex payment channel node
#[derive(Parser, Debug)]
#[command(name = "duplex-node", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file.
    Init(InitArgs),
    /// Start the node.
    Start(StartArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    #[arg(short, long, default_value = "duplex.toml")]
    config: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct StartArgs {
    #[arg(short, long, default_value = "duplex.toml")]
    config: PathBuf,

    /// Override the transport listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the API port.
    #[arg(long)]
    api_port: Option<u16>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init(args: &InitArgs) -> anyhow::Result<()> {
    init_tracing("info", "text");
    if args.config.exists() && !args.force {
        anyhow::bail!("configuration file already exists at {}", args.config.display());
    }
    NodeConfig::default().save(&args.config)?;
    tracing::info!(path = %args.config.display(), "wrote default config");
    Ok(())
}

async fn start(args: &StartArgs) -> anyhow::Result<()> {
    let mut config = NodeConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(api_port) = args.api_port {
        config.api.port = api_port;
    }
    if let Some(ref data_dir) = args.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    if let Some(ref level) = args.log_level {
        config.node.log_level = level.clone();
    }
    init_tracing(&config.node.log_level, &config.node.log_format);

    tracing::info!("Duplex node v{}", env!("CARGO_PKG_VERSION"));

    let mut node = DuplexNode::new(config)?;
    node.start().await?;
    tracing::info!(address = %node.address(), "node started");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("received shutdown signal");
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "node event loop error");
            }
        }
        _ = shutdown => {
            tracing::info!("initiating graceful shutdown");
        }
    }

    node.shutdown().await?;
    tracing::info!("Duplex node exited cleanly");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Init(args) => init(args),
        Commands::Start(args) => start(args).await,
    }
}
