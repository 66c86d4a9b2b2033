#![forbid(unsafe_code)]
//! Lodestone server binary: loads configuration, wires the node and serves
//! the ledger API until SIGINT or SIGTERM.

use clap::Parser;
use lodestone::config::load_config;
use lodestone::node::Node;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
    /// Override the listen host from the configuration
    #[arg(long)]
    host: Option<String>,
    /// Override the listen port from the configuration
    #[arg(long)]
    port: Option<u16>,
    /// Turn the persisted mining switch on at startup
    #[arg(long)]
    enable_mining: bool,
    /// Turn the persisted transaction switch on at startup
    #[arg(long)]
    enable_transactions: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    info!(config = %cli.config, "starting lodestone node");
    let node = Arc::new(Node::init(config)?);

    if cli.enable_mining {
        node.state.set_mining_enabled(&node.db.conn(), true)?;
    }
    if cli.enable_transactions {
        node.state.set_transactions_enabled(&node.db.conn(), true)?;
    }

    node.start().await
}
