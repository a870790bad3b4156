//! Integration tests for configuration persistence across the registry
//! boundary. The config directory is redirected per test via
//! `PEERSYNC_CONFIG_DIR`, so these run serially.

use peersync::config::Config;
use peersync::registry::{PairedDevice, ProfileDef, ProfileFlags, ProfileRegistry};
use pretty_assertions::assert_eq;
use serial_test::serial;
use tempfile::TempDir;

fn set_config_dir(dir: &TempDir) {
    std::env::set_var("PEERSYNC_CONFIG_DIR", dir.path());
}

#[tokio::test]
#[serial]
async fn test_init_then_load_round_trip() {
    let temp = TempDir::new().unwrap();
    set_config_dir(&temp);

    let config = Config::init().await.unwrap();
    let loaded = Config::load().await.unwrap();
    assert_eq!(config.listen_port, loaded.listen_port);
    assert_eq!(config.device_name, loaded.device_name);

    std::env::remove_var("PEERSYNC_CONFIG_DIR");
}

#[tokio::test]
#[serial]
async fn test_double_init_fails() {
    let temp = TempDir::new().unwrap();
    set_config_dir(&temp);

    Config::init().await.unwrap();
    assert!(Config::init().await.is_err());

    std::env::remove_var("PEERSYNC_CONFIG_DIR");
}

#[tokio::test]
#[serial]
async fn test_load_without_init_fails() {
    let temp = TempDir::new().unwrap();
    set_config_dir(&temp);

    assert!(Config::load().await.is_err());

    std::env::remove_var("PEERSYNC_CONFIG_DIR");
}

#[tokio::test]
#[serial]
async fn test_registry_state_survives_restart() {
    let temp = TempDir::new().unwrap();
    set_config_dir(&temp);

    let mut config = Config::init().await.unwrap();

    // First run: user configures a profile and a pairing lands
    let registry = ProfileRegistry::new();
    let docs = temp.path().join("docs");
    tokio::fs::create_dir_all(&docs).await.unwrap();
    let profile_id = registry.add_profile(ProfileDef {
        path: docs.clone(),
        name: "docs".into(),
        flags: ProfileFlags::default(),
    });
    registry.add_pairing(PairedDevice {
        device_id: "f00d".repeat(16),
        display_name: "other-laptop".into(),
        public_key: [3u8; 32],
        last_address: Some("192.168.1.9:44620".parse().unwrap()),
        paired_at: chrono::Utc::now(),
    });
    registry.share_profile(profile_id, &"f00d".repeat(16));
    config.save_registry(&registry).await.unwrap();

    // Second run: everything is back
    let reloaded = Config::load().await.unwrap();
    let fresh = ProfileRegistry::new();
    reloaded.populate_registry(&fresh);

    let profile = fresh.profile(profile_id).unwrap();
    assert_eq!(profile.path, docs);
    assert_eq!(profile.shared_with, vec!["f00d".repeat(16)]);

    let device = fresh.paired_device(&"f00d".repeat(16)).unwrap();
    assert_eq!(device.display_name, "other-laptop");
    assert_eq!(device.public_key, [3u8; 32]);

    std::env::remove_var("PEERSYNC_CONFIG_DIR");
}
