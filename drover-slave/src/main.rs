//! drover-slave - worker process entry point
//!
//! Connects outward to a master, registers, and serves operations until the
//! master disconnects.

use clap::Parser;
use drover_proto::{transport, Wire};
use drover_slave::SlaveServer;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drover-slave")]
#[command(about = "Connect to a drover master and run operations for it")]
#[command(version)]
struct Cli {
    /// Master address (host:port)
    master: String,

    /// Hostname to register as (default: this machine's hostname)
    #[arg(long, env = "DROVER_HOSTNAME")]
    hostname: Option<String>,

    /// Directory to start in (default: the current directory)
    #[arg(long, env = "DROVER_WORKDIR")]
    workdir: Option<PathBuf>,
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

    let hostname = match cli.hostname {
        Some(name) => name,
        None => gethostname::gethostname().to_string_lossy().into_owned(),
    };
    let workdir = match cli.workdir {
        Some(dir) => dir.canonicalize()?,
        None => std::env::current_dir()?,
    };

    tracing::info!("connecting to {}", cli.master);
    let stream = TcpStream::connect(&cli.master).await?;
    let wire = Wire::new(transport::from_tcp(stream));

    let mut server = SlaveServer::new(wire, workdir);
    server.register(&hostname).await?;
    tracing::info!("registered as {}", hostname);

    server.serve().await?;
    tracing::info!("master disconnected, exiting");
    Ok(())
}
