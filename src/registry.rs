//! # Profile Registry
//!
//! In-memory owner of the synchronized-directory definitions (profiles)
//! and the set of paired remote devices. Every mutation raises a change
//! notification on a broadcast channel; the external persistence
//! collaborator listens and saves after each one, so the registry itself
//! only needs bulk load at startup and bulk export on save.
//!
//! Reads hand out cloned snapshots taken under a short read lock; writes
//! are serialized through the single write lock.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Per-profile synchronization permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFlags {
    pub allow_send: bool,
    pub allow_receive: bool,
    pub allow_delete: bool,
    pub skip_hidden: bool,
}

impl Default for ProfileFlags {
    fn default() -> Self {
        Self {
            allow_send: true,
            allow_receive: true,
            allow_delete: false,
            skip_hidden: true,
        }
    }
}

/// A local directory participating in synchronization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub path: PathBuf,
    pub name: String,
    pub flags: ProfileFlags,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Devices this profile is shared with.
    #[serde(default)]
    pub shared_with: Vec<String>,
}

/// Definition used to create or update a profile.
#[derive(Clone, Debug)]
pub struct ProfileDef {
    pub path: PathBuf,
    pub name: String,
    pub flags: ProfileFlags,
}

/// A remote device this device has paired with.
///
/// The public key is pinned at pairing time; a reconnect presenting a
/// different key for the same id is an authentication failure, never an
/// upgrade.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairedDevice {
    pub device_id: String,
    pub display_name: String,
    pub public_key: [u8; 32],
    pub last_address: Option<SocketAddr>,
    pub paired_at: chrono::DateTime<chrono::Utc>,
}

/// Change notification raised by every mutating registry call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    ProfileAdded(Uuid),
    ProfileUpdated(Uuid),
    ProfileRemoved(Uuid),
    PairAdded(String),
    PairUpdated(String),
    PairRemoved(String),
}

#[derive(Default)]
struct RegistryState {
    profiles: Vec<Profile>,
    paired: Vec<PairedDevice>,
}

#[derive(Clone)]
pub struct ProfileRegistry {
    state: Arc<RwLock<RegistryState>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            events,
        }
    }

    /// Subscribe to change notifications. Missed events only matter for
    /// persistence batching, so a bounded channel is fine.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: RegistryEvent) {
        // No receivers is a valid state (e.g. during tests)
        let _ = self.events.send(event);
    }

    /// Replace the registry contents wholesale. Used at startup from the
    /// persisted configuration; raises no notifications.
    pub fn bulk_load(&self, profiles: Vec<Profile>, paired: Vec<PairedDevice>) {
        let mut state = self.state.write();
        state.profiles = profiles;
        state.paired = paired;
    }

    /// Snapshot of everything, for persistence.
    pub fn export(&self) -> (Vec<Profile>, Vec<PairedDevice>) {
        let state = self.state.read();
        (state.profiles.clone(), state.paired.clone())
    }

    pub fn list_profiles(&self) -> Vec<Profile> {
        self.state.read().profiles.clone()
    }

    pub fn profile(&self, id: Uuid) -> Option<Profile> {
        self.state.read().profiles.iter().find(|p| p.id == id).cloned()
    }

    pub fn add_profile(&self, def: ProfileDef) -> Uuid {
        let id = Uuid::new_v4();
        let profile = Profile {
            id,
            path: def.path,
            name: def.name,
            flags: def.flags,
            created_at: chrono::Utc::now(),
            shared_with: Vec::new(),
        };
        self.state.write().profiles.push(profile);
        self.notify(RegistryEvent::ProfileAdded(id));
        id
    }

    pub fn update_profile(&self, id: Uuid, def: ProfileDef) -> bool {
        let updated = {
            let mut state = self.state.write();
            match state.profiles.iter_mut().find(|p| p.id == id) {
                Some(profile) => {
                    profile.path = def.path;
                    profile.name = def.name;
                    profile.flags = def.flags;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify(RegistryEvent::ProfileUpdated(id));
        }
        updated
    }

    pub fn remove_profile(&self, id: Uuid) -> bool {
        let removed = {
            let mut state = self.state.write();
            let before = state.profiles.len();
            state.profiles.retain(|p| p.id != id);
            state.profiles.len() != before
        };
        if removed {
            self.notify(RegistryEvent::ProfileRemoved(id));
        }
        removed
    }

    /// Record that a profile is shared with a device.
    pub fn share_profile(&self, id: Uuid, device_id: &str) -> bool {
        let changed = {
            let mut state = self.state.write();
            match state.profiles.iter_mut().find(|p| p.id == id) {
                Some(profile) if !profile.shared_with.iter().any(|d| d == device_id) => {
                    profile.shared_with.push(device_id.to_string());
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify(RegistryEvent::ProfileUpdated(id));
        }
        changed
    }

    pub fn unshare_profile(&self, id: Uuid, device_id: &str) -> bool {
        let changed = {
            let mut state = self.state.write();
            match state.profiles.iter_mut().find(|p| p.id == id) {
                Some(profile) => {
                    let before = profile.shared_with.len();
                    profile.shared_with.retain(|d| d != device_id);
                    profile.shared_with.len() != before
                }
                None => false,
            }
        };
        if changed {
            self.notify(RegistryEvent::ProfileUpdated(id));
        }
        changed
    }

    /// Profiles shared with the given device.
    pub fn profiles_shared_with(&self, device_id: &str) -> Vec<Profile> {
        self.state
            .read()
            .profiles
            .iter()
            .filter(|p| p.shared_with.iter().any(|d| d == device_id))
            .cloned()
            .collect()
    }

    pub fn list_paired_devices(&self) -> Vec<PairedDevice> {
        self.state.read().paired.clone()
    }

    pub fn paired_device(&self, device_id: &str) -> Option<PairedDevice> {
        self.state
            .read()
            .paired
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned()
    }

    pub fn is_paired(&self, device_id: &str) -> bool {
        self.state
            .read()
            .paired
            .iter()
            .any(|d| d.device_id == device_id)
    }

    pub fn add_pairing(&self, device: PairedDevice) {
        let id = device.device_id.clone();
        {
            let mut state = self.state.write();
            // Re-pairing replaces the stored record
            state.paired.retain(|d| d.device_id != id);
            state.paired.push(device);
        }
        self.notify(RegistryEvent::PairAdded(id));
    }

    pub fn remove_pairing(&self, device_id: &str) -> bool {
        let removed = {
            let mut state = self.state.write();
            let before = state.paired.len();
            state.paired.retain(|d| d.device_id != device_id);
            let removed = state.paired.len() != before;
            if removed {
                // Drop the device from every profile share as well
                for profile in state.profiles.iter_mut() {
                    profile.shared_with.retain(|d| d != device_id);
                }
            }
            removed
        };
        if removed {
            self.notify(RegistryEvent::PairRemoved(device_id.to_string()));
        }
        removed
    }

    /// Refresh the stored display name and address of a paired device
    /// after a successful handshake.
    pub fn touch_pairing(&self, device_id: &str, display_name: &str, address: SocketAddr) {
        let changed = {
            let mut state = self.state.write();
            match state.paired.iter_mut().find(|d| d.device_id == device_id) {
                Some(device) => {
                    let renamed = device.display_name != display_name;
                    device.display_name = display_name.to_string();
                    device.last_address = Some(address);
                    renamed
                }
                None => false,
            }
        };
        if changed {
            self.notify(RegistryEvent::PairUpdated(device_id.to_string()));
        }
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device(id: &str) -> PairedDevice {
        PairedDevice {
            device_id: id.to_string(),
            display_name: format!("device-{id}"),
            public_key: [7u8; 32],
            last_address: None,
            paired_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_profile_lifecycle() {
        let registry = ProfileRegistry::new();
        let mut events = registry.subscribe();

        let id = registry.add_profile(ProfileDef {
            path: PathBuf::from("/data/docs"),
            name: "docs".into(),
            flags: ProfileFlags::default(),
        });
        assert_eq!(registry.list_profiles().len(), 1);
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::ProfileAdded(id));

        let mut flags = ProfileFlags::default();
        flags.allow_delete = true;
        assert!(registry.update_profile(
            id,
            ProfileDef {
                path: PathBuf::from("/data/docs"),
                name: "documents".into(),
                flags,
            }
        ));
        assert_eq!(registry.profile(id).unwrap().name, "documents");
        assert!(registry.profile(id).unwrap().flags.allow_delete);
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::ProfileUpdated(id));

        assert!(registry.remove_profile(id));
        assert!(registry.list_profiles().is_empty());
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::ProfileRemoved(id));

        // Removing again is a no-op and raises nothing
        assert!(!registry.remove_profile(id));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_pairing_lifecycle() {
        let registry = ProfileRegistry::new();
        let mut events = registry.subscribe();

        registry.add_pairing(test_device("aa"));
        assert!(registry.is_paired("aa"));
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::PairAdded("aa".into())
        );

        assert!(registry.remove_pairing("aa"));
        assert!(!registry.is_paired("aa"));
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::PairRemoved("aa".into())
        );
    }

    #[test]
    fn test_unpair_clears_profile_shares() {
        let registry = ProfileRegistry::new();
        registry.add_pairing(test_device("aa"));
        let id = registry.add_profile(ProfileDef {
            path: PathBuf::from("/data"),
            name: "data".into(),
            flags: ProfileFlags::default(),
        });
        assert!(registry.share_profile(id, "aa"));
        assert_eq!(registry.profiles_shared_with("aa").len(), 1);

        registry.remove_pairing("aa");
        assert!(registry.profiles_shared_with("aa").is_empty());
    }

    #[test]
    fn test_share_is_idempotent() {
        let registry = ProfileRegistry::new();
        let id = registry.add_profile(ProfileDef {
            path: PathBuf::from("/data"),
            name: "data".into(),
            flags: ProfileFlags::default(),
        });
        assert!(registry.share_profile(id, "aa"));
        assert!(!registry.share_profile(id, "aa"));
        assert_eq!(registry.profile(id).unwrap().shared_with.len(), 1);

        assert!(registry.unshare_profile(id, "aa"));
        assert!(!registry.unshare_profile(id, "aa"));
    }

    #[test]
    fn test_bulk_load_and_export_round_trip() {
        let registry = ProfileRegistry::new();
        let id = registry.add_profile(ProfileDef {
            path: PathBuf::from("/a"),
            name: "a".into(),
            flags: ProfileFlags::default(),
        });
        registry.add_pairing(test_device("bb"));

        let (profiles, paired) = registry.export();
        assert_eq!(profiles.len(), 1);
        assert_eq!(paired.len(), 1);

        let other = ProfileRegistry::new();
        other.bulk_load(profiles, paired);
        assert_eq!(other.profile(id).unwrap().name, "a");
        assert!(other.is_paired("bb"));
    }

    #[test]
    fn test_touch_pairing_updates_name_and_address() {
        let registry = ProfileRegistry::new();
        registry.add_pairing(test_device("aa"));

        let addr: SocketAddr = "10.0.0.5:41500".parse().unwrap();
        registry.touch_pairing("aa", "renamed", addr);

        let device = registry.paired_device("aa").unwrap();
        assert_eq!(device.display_name, "renamed");
        assert_eq!(device.last_address, Some(addr));
    }
}
