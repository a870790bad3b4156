//! # Engine Assembly
//!
//! Wires the long-lived services together and runs the daemon: identity,
//! registry, QUIC listener, discovery, peer manager, profile watcher,
//! progress tracker, and the persistence loop that saves configuration
//! after every registry mutation.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::DiscoveryService;
use crate::identity::DeviceIdentity;
use crate::listener::ConnectionListener;
use crate::peer::{PeerEvent, PeerManager};
use crate::progress::ProgressTracker;
use crate::registry::{ProfileRegistry, RegistryEvent};
use crate::watcher::{LocalChange, ProfileWatcher};

/// How often paired-but-disconnected devices are redialed.
const DIAL_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(5);

/// Run the synchronization engine until interrupted.
pub async fn run(config: Config) -> Result<()> {
    let identity = DeviceIdentity::load_or_create(&config.identity_path(), &config.device_name)?;
    info!("Device id: {}", identity.device_id());

    let registry = ProfileRegistry::new();
    config.populate_registry(&registry);

    let peer = PeerManager::new(identity.clone(), registry.clone());

    let listener = Arc::new(ConnectionListener::bind(&identity, config.listen_port)?);
    let _accept_task = listener.spawn_accept_loop(peer.clone());
    let listen_port = listener.local_addr()?.port();

    let mut discovery = DiscoveryService::new(
        identity.device_id(),
        identity.display_name().to_string(),
        listen_port,
        config.discovery_port,
    );
    if config.discovery_enabled {
        discovery.start();
    } else {
        info!("Discovery disabled by configuration");
    }
    let discovery = Arc::new(discovery);

    // Save after every registry mutation; a failed save degrades
    // durability but never stops the engine
    let persistence = spawn_persistence_loop(config, registry.clone(), peer.clone());

    let dialer = spawn_dial_loop(peer.clone(), listener.clone(), discovery.clone());
    let events = spawn_event_loop(peer.clone(), listener.clone(), discovery.clone());
    let changes = spawn_watcher_loop(registry.clone(), peer.clone());

    let (_tracker, mut progress_rx) = ProgressTracker::start(peer.clone());
    let progress = tokio::spawn(async move {
        while progress_rx.changed().await.is_ok() {
            let snapshot = progress_rx.borrow().clone();
            if !snapshot.is_idle() {
                debug!(
                    "Transfers: {}/{} bytes ({:.1}%) across {} shares",
                    snapshot.completed_bytes,
                    snapshot.total_bytes,
                    snapshot.percent_complete(),
                    snapshot.shares.len()
                );
            }
        }
    });

    info!("peersync engine started");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    listener.close();
    for task in [persistence, dialer, events, changes, progress] {
        task.abort();
    }
    Ok(())
}

fn spawn_persistence_loop(
    config: Config,
    registry: ProfileRegistry,
    peer: PeerManager,
) -> tokio::task::JoinHandle<()> {
    let mut registry_events = registry.subscribe();
    let config = Arc::new(Mutex::new(config));

    tokio::spawn(async move {
        loop {
            let event = match registry_events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Persistence loop lagged by {} events", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            {
                let mut config = config.lock().await;
                if let Err(e) = config.save_registry(&registry).await {
                    warn!("Failed to persist configuration: {} (continuing in memory)", e);
                }
            }

            // Profile set changes also change what sessions should offer
            if let RegistryEvent::ProfileAdded(id)
            | RegistryEvent::ProfileUpdated(id)
            | RegistryEvent::ProfileRemoved(id) = event
            {
                peer.notify_local_change(id);
            }
        }
    })
}

/// Reconnect loop: dial every paired device that is not connected, via
/// its discovery candidate or its stored address. Devices that are
/// neither discovered nor remembered are never dialed.
fn spawn_dial_loop(
    peer: PeerManager,
    listener: Arc<ConnectionListener>,
    discovery: Arc<DiscoveryService>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DIAL_INTERVAL);
        loop {
            ticker.tick().await;
            for device in peer.registry().list_paired_devices() {
                if peer.is_connected(&device.device_id) {
                    continue;
                }
                let address = discovery
                    .candidate(&device.device_id)
                    .map(|c| c.address)
                    .or(device.last_address);
                let Some(address) = address else { continue };

                if let Err(e) = listener.connect(&peer, address).await {
                    debug!("Redial of {} at {} failed: {}", device.device_id, address, e);
                }
            }
        }
    })
}

fn spawn_event_loop(
    peer: PeerManager,
    listener: Arc<ConnectionListener>,
    discovery: Arc<DiscoveryService>,
) -> tokio::task::JoinHandle<()> {
    let mut events = peer.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PeerEvent::DialRequested { device_id }) => {
                    let Some(candidate) = discovery.candidate(&device_id) else {
                        warn!("Cannot pair with {}: not present in discovery", device_id);
                        continue;
                    };
                    if let Err(e) = listener.connect(&peer, candidate.address).await {
                        warn!("Pairing dial to {} failed: {}", candidate.address, e);
                    }
                }
                Ok(PeerEvent::PairingRequested {
                    device_id,
                    display_name,
                }) => {
                    // Surfaced for the external confirmation flow
                    info!(
                        "Pairing request from {} ({}); confirm with 'peersync accept {}'",
                        display_name, device_id, device_id
                    );
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Own the filesystem watcher, forward its debounced changes to the
/// Peer Manager, and rebuild it whenever the profile set changes.
fn spawn_watcher_loop(registry: ProfileRegistry, peer: PeerManager) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (change_tx, mut change_rx) = mpsc::channel(64);
        let mut watcher = match ProfileWatcher::new(registry.list_profiles(), change_tx.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Filesystem watching unavailable: {}", e);
                None
            }
        };
        let mut registry_events = registry.subscribe();

        loop {
            tokio::select! {
                change = change_rx.recv() => {
                    match change {
                        Some(LocalChange::Modified { profile_id }) => {
                            peer.notify_local_change(profile_id)
                        }
                        Some(LocalChange::Removed { profile_id, path, is_dir }) => {
                            peer.notify_local_delete(profile_id, path, is_dir)
                        }
                        None => return,
                    }
                }
                event = registry_events.recv() => {
                    match event {
                        Ok(RegistryEvent::ProfileAdded(_))
                        | Ok(RegistryEvent::ProfileUpdated(_))
                        | Ok(RegistryEvent::ProfileRemoved(_)) => {
                            drop(watcher.take());
                            watcher = ProfileWatcher::new(
                                registry.list_profiles(),
                                change_tx.clone(),
                            )
                            .map_err(|e| warn!("Failed to rebuild watcher: {}", e))
                            .ok();
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    })
}
