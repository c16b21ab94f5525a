//! Emberstone node daemon.
//!
//! Loads configuration, constructs the node core, and drives the
//! cooperative loop. The radio and mesh transports are wired in by the
//! surrounding firmware build; this binary exposes their channel ends and
//! otherwise just runs.

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use emberstone::{Node, NodeConfig};

#[derive(Debug, Parser)]
#[command(name = "emberstoned", about = "Emberstone node runtime core")]
struct Args {
    /// Path to the JSON config file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_target(true).init();

    info!("Emberstone node starting");

    let config = match &args.config {
        Some(path) => match NodeConfig::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded config file");
                config
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No config file given, using defaults");
            NodeConfig::default()
        }
    };

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to create node: {}", e);
            std::process::exit(1);
        }
    };
    info!(stone_id = node.config().stone_id, "Node created");

    // Transport ends. The scanner and command source run outside the core;
    // keeping the senders alive keeps the loop running.
    let (_scan_tx, scan_rx) = mpsc::channel(64);
    let (_command_tx, command_rx) = mpsc::channel(16);

    info!("Node running, press Ctrl+C to exit");
    tokio::select! {
        _ = node.run(scan_rx, command_rx) => {
            info!("Node loop ended");
        }
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    }

    info!("Emberstone node shut down");
}
