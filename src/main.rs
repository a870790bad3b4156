//! # peersync daemon and CLI
//!
//! Entry point for the peersync peer-to-peer directory synchronization
//! service. Parses the command line, sets up logging, and dispatches to
//! the configuration commands or the long-running engine.

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod config;
mod discovery;
mod engine;
mod error;
mod handshake;
mod identity;
mod listener;
mod peer;
mod progress;
mod registry;
mod transfer;
mod watcher;
mod wire;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peersync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = match cli.command {
        Commands::Init => cli::init().await,
        Commands::Id => cli::show_id().await,
        Commands::Add {
            path,
            name,
            no_send,
            no_receive,
            allow_delete,
            include_hidden,
        } => cli::add_profile(path, name, no_send, no_receive, allow_delete, include_hidden).await,
        Commands::Remove { id } => cli::remove_profile(id).await,
        Commands::List => cli::list_profiles().await,
        Commands::Peers => cli::list_peers().await,
        Commands::Unpair { device_id } => cli::unpair(device_id).await,
        Commands::Status => cli::show_status().await,
        Commands::Daemon => cli::run_daemon().await,
    } {
        eprintln!("{} {}", "Error:".red().bold(), e.to_string().red());
        std::process::exit(1);
    }
    Ok(())
}
