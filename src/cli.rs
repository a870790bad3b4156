//! # Command-Line Interface
//!
//! User-facing commands for managing the peersync configuration and
//! running the daemon. Configuration commands operate directly on the
//! persisted config; `daemon` hands control to the engine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::Config;
use crate::identity::DeviceIdentity;
use crate::registry::{Profile, ProfileFlags};

#[derive(Parser)]
#[command(name = "peersync")]
#[command(about = "Peer-to-peer directory synchronization", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize peersync configuration and device identity
    Init,
    /// Show this device's identifier
    Id,
    /// Add a directory as a synchronization profile
    Add {
        /// Directory to synchronize
        path: PathBuf,
        /// Human-readable profile name
        #[arg(long)]
        name: Option<String>,
        /// Do not send local files to peers
        #[arg(long)]
        no_send: bool,
        /// Do not accept files from peers
        #[arg(long)]
        no_receive: bool,
        /// Allow peers' deletions to be applied locally
        #[arg(long)]
        allow_delete: bool,
        /// Synchronize hidden (dot-prefixed) files too
        #[arg(long)]
        include_hidden: bool,
    },
    /// Remove a synchronization profile
    Remove {
        /// Profile id
        id: Uuid,
    },
    /// List configured profiles
    List,
    /// List paired devices
    Peers,
    /// Remove a device pairing
    Unpair {
        /// Device id
        device_id: String,
    },
    /// Show configuration status
    Status,
    /// Run the synchronization engine
    Daemon,
}

pub async fn init() -> Result<()> {
    let config = Config::init().await?;
    let identity = DeviceIdentity::load_or_create(&config.identity_path(), &config.device_name)?;

    println!("{}", "peersync initialized".green().bold());
    println!("  Config:    {}", config.config_path().display());
    println!("  Device id: {}", identity.device_id());
    println!("  Name:      {}", identity.display_name());
    Ok(())
}

pub async fn show_id() -> Result<()> {
    let config = Config::load().await?;
    let identity = DeviceIdentity::load_or_create(&config.identity_path(), &config.device_name)?;
    println!("{}", identity.device_id());
    Ok(())
}

#[allow(clippy::fn_params_excessive_bools)]
pub async fn add_profile(
    path: PathBuf,
    name: Option<String>,
    no_send: bool,
    no_receive: bool,
    allow_delete: bool,
    include_hidden: bool,
) -> Result<()> {
    let mut config = Config::load().await?;

    let path = path.canonicalize().map_err(|e| {
        anyhow::anyhow!("Cannot resolve {}: {}", path.display(), e)
    })?;
    if !path.is_dir() {
        anyhow::bail!("{} is not a directory", path.display());
    }
    if config.profiles.iter().any(|p| p.path == path) {
        anyhow::bail!("{} is already a profile", path.display());
    }

    let name = name.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string())
    });
    let profile = Profile {
        id: Uuid::new_v4(),
        path,
        name: name.clone(),
        flags: ProfileFlags {
            allow_send: !no_send,
            allow_receive: !no_receive,
            allow_delete,
            skip_hidden: !include_hidden,
        },
        created_at: chrono::Utc::now(),
        shared_with: Vec::new(),
    };
    let id = profile.id;
    config.profiles.push(profile);
    config.save().await?;

    println!("{} profile {} ({})", "Added".green().bold(), name, id);
    Ok(())
}

pub async fn remove_profile(id: Uuid) -> Result<()> {
    let mut config = Config::load().await?;
    let before = config.profiles.len();
    config.profiles.retain(|p| p.id != id);
    if config.profiles.len() == before {
        anyhow::bail!("No profile with id {}", id);
    }
    config.save().await?;
    println!("{} profile {}", "Removed".green().bold(), id);
    Ok(())
}

pub async fn list_profiles() -> Result<()> {
    let config = Config::load().await?;
    if config.profiles.is_empty() {
        println!("No profiles configured. Add one with 'peersync add <path>'.");
        return Ok(());
    }
    for profile in &config.profiles {
        println!("{} {}", profile.id.to_string().cyan(), profile.name.bold());
        println!("    Path:        {}", profile.path.display());
        println!("    Permissions: {}", describe_flags(&profile.flags));
        if !profile.shared_with.is_empty() {
            println!("    Shared with: {}", profile.shared_with.join(", "));
        }
    }
    Ok(())
}

pub async fn list_peers() -> Result<()> {
    let config = Config::load().await?;
    if config.paired_devices.is_empty() {
        println!("No paired devices.");
        return Ok(());
    }
    for device in &config.paired_devices {
        println!(
            "{} {}",
            device.device_id.cyan(),
            device.display_name.bold()
        );
        if let Some(address) = device.last_address {
            println!("    Last seen at {}", address);
        }
        println!("    Paired {}", device.paired_at.format("%Y-%m-%d %H:%M"));
    }
    Ok(())
}

pub async fn unpair(device_id: String) -> Result<()> {
    let mut config = Config::load().await?;
    let before = config.paired_devices.len();
    config.paired_devices.retain(|d| d.device_id != device_id);
    if config.paired_devices.len() == before {
        anyhow::bail!("No paired device {}", device_id);
    }
    for profile in &mut config.profiles {
        profile.shared_with.retain(|d| *d != device_id);
    }
    config.save().await?;
    println!("{} {}", "Unpaired".green().bold(), device_id);
    Ok(())
}

pub async fn show_status() -> Result<()> {
    let config = Config::load().await?;
    let identity = DeviceIdentity::load_or_create(&config.identity_path(), &config.device_name)?;

    println!("{}", "peersync status".bold());
    println!("  Device:    {} ({})", identity.display_name(), identity.device_id());
    println!("  Listen:    port {}", config.listen_port);
    println!(
        "  Discovery: {} (port {})",
        if config.discovery_enabled { "on" } else { "off" },
        config.discovery_port
    );
    println!("  Profiles:  {}", config.profiles.len());
    println!("  Pairings:  {}", config.paired_devices.len());
    Ok(())
}

pub async fn run_daemon() -> Result<()> {
    let config = Config::load().await?;
    crate::engine::run(config).await
}

fn describe_flags(flags: &ProfileFlags) -> String {
    let mut parts = Vec::new();
    if flags.allow_send {
        parts.push("send");
    }
    if flags.allow_receive {
        parts.push("receive");
    }
    if flags.allow_delete {
        parts.push("delete");
    }
    if flags.skip_hidden {
        parts.push("skip-hidden");
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}
