use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use gossamer::{SeedDirectory, SeedNode};

/// Seed coordinator for the gossip overlay.
#[derive(Parser, Debug)]
#[command(name = "seed")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Seed directory file: one `IP,PORT` per line.
    config_path: PathBuf,

    /// Port this seed listens on (should appear in the config).
    listen_port: u16,
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
    let seed = SeedNode::start(directory, args.listen_port).await?;
    info!(seed = %seed.id(), "running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, exiting gracefully");
    seed.shutdown().await;

    Ok(())
}
