#![forbid(unsafe_code)]
//! Standalone BYOB node. Mines on its own chain until interrupted.

use byob::config::load_config;
use byob::keystore::{FileKeyStore, KeyStore};
use byob::network::LocalNetwork;
use byob::node::{Node, NodeOptions};
use byob::persistence::Database;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop once the highest block reaches this height
    #[arg(long)]
    until_height: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let params = config.params()?;

    let keystore = Arc::new(FileKeyStore::open(&config.storage.keys_file)?);
    if keystore.is_empty() {
        keystore.generate_key()?;
    }
    let identity = keystore.public_keys()[0].clone();

    let db_path = config.storage.db_file.to_string_lossy().into_owned();
    let database = Database::open(&db_path)?;

    let network = LocalNetwork::new();
    let (transport, inbound) = network.join(identity.clone());

    let node = Node::new(
        params,
        NodeOptions::from(&config),
        keystore,
        Box::new(transport),
        Box::new(database),
    )?;
    info!("Node {} starting at height {}", identity, node.height());

    let mut height = node.subscribe_height();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(node.run(inbound, stop_rx));

    let until_height = cli.until_height;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        Ok(reached) = height.wait_for(|h| until_height.is_some_and(|target| *h >= target)) => {
            info!("Reached height {}", *reached);
        }
    }

    let _ = stop_tx.send(true);
    let node = handle.await?;
    info!("Stopped at height {}", node.height());
    Ok(())
}
