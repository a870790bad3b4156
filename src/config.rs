//! # Configuration Management
//!
//! TOML-backed persistence for peersync: node-level settings, the profile
//! definitions, and the paired-device set. The engine treats this module
//! as the external persistence collaborator: it bulk-loads the registry
//! at startup and saves after every registry/peer change notification.
//!
//! Files live in a platform-appropriate directory (e.g.
//! `~/.config/peersync/` on Linux), overridable with the
//! `PEERSYNC_CONFIG_DIR` environment variable for tests.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::registry::{PairedDevice, Profile, ProfileRegistry};

pub const DEFAULT_LISTEN_PORT: u16 = 44620;
pub const DEFAULT_DISCOVERY_PORT: u16 = 44621;

/// Persistent node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub device_name: String,
    pub listen_port: u16,
    pub discovery_port: u16,
    pub discovery_enabled: bool,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub paired_devices: Vec<PairedDevice>,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

impl Config {
    /// Create a fresh configuration on disk. Fails if one already exists.
    pub async fn init() -> Result<Self> {
        let config_dir = Self::config_dir()?;
        tokio::fs::create_dir_all(&config_dir).await?;

        let config_file = config_dir.join("config.toml");
        if config_file.exists() {
            anyhow::bail!("peersync is already initialized at {}", config_file.display());
        }

        let config = Self {
            device_name: default_device_name(),
            listen_port: DEFAULT_LISTEN_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_enabled: true,
            profiles: Vec::new(),
            paired_devices: Vec::new(),
            config_file_path: config_file,
        };
        config.save().await?;
        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        let config_file = Self::config_dir()?.join("config.toml");
        if !config_file.exists() {
            anyhow::bail!("peersync not initialized. Run 'peersync init' first.");
        }
        Self::load_from(&config_file).await
    }

    pub async fn load_from(config_file: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(config_file).await?;
        let mut config: Config = toml::from_str(&content)?;
        config.config_file_path = config_file.to_path_buf();
        Ok(config)
    }

    pub async fn save(&self) -> Result<(), SyncError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        if let Some(parent) = self.config_file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Persistence(e.to_string()))?;
        }
        tokio::fs::write(&self.config_file_path, content)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Pull the current registry contents and persist them.
    pub async fn save_registry(&mut self, registry: &ProfileRegistry) -> Result<(), SyncError> {
        let (profiles, paired) = registry.export();
        self.profiles = profiles;
        self.paired_devices = paired;
        self.save().await
    }

    /// Seed a registry with the persisted profiles and pairings.
    pub fn populate_registry(&self, registry: &ProfileRegistry) {
        registry.bulk_load(self.profiles.clone(), self.paired_devices.clone());
    }

    pub fn identity_path(&self) -> PathBuf {
        self.config_file_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
            .join("identity.toml")
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("PEERSYNC_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("peersync");
        Ok(config_dir)
    }
}

fn default_device_name() -> String {
    hostname().unwrap_or_else(|| "peersync-device".to_string())
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
}
