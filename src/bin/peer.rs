use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use gossamer::{PeerNode, SeedDirectory};

/// Overlay peer: registers with the seeds, attaches by preferential
/// attachment, gossips, and monitors its neighbors.
#[derive(Parser, Debug)]
#[command(name = "peer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Seed directory file: one `IP,PORT` per line.
    config_path: PathBuf,

    /// Port this peer listens on.
    listen_port: u16,

    /// IP address to advertise to other nodes.
    #[arg(default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind_ip: IpAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let directory = SeedDirectory::load(&args.config_path)?;
    let peer = PeerNode::start(directory, args.bind_ip, args.listen_port).await?;
    info!(peer = %peer.id(), "running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, exiting gracefully");
    peer.shutdown().await;

    Ok(())
}
