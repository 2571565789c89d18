//! drover - drive remote worker processes
//!
//! The master binary: listens for slave connections on a TCP port and
//! offers an interactive prompt over the registry.

mod repl;

use clap::Parser;
use drover_master::{MasterConfig, SlaveRegistry, TcpSlaveListener};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Drive remote worker processes over a framed box protocol")]
#[command(version)]
struct Cli {
    /// Address to listen on for slave connections
    #[arg(short, long, env = "DROVER_BIND")]
    bind: Option<SocketAddr>,

    /// Path to a YAML configuration file
    #[arg(short, long, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration (file if given, then env overrides, then flags)
    let mut config = match &cli.config {
        Some(path) => {
            let loaded = MasterConfig::from_file(path)?;
            tracing::info!("loaded config from {}", path.display());
            loaded
        }
        None => MasterConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let registry = SlaveRegistry::new();
    let listener = TcpSlaveListener::bind(registry.clone(), &config).await?;
    let addr = listener.local_addr()?;
    tracing::info!("master listening on {}", addr);

    tokio::spawn(listener.run());

    repl::run(registry, addr).await
}
