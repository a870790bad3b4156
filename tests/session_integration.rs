//! End-to-end session tests: two peer managers joined by an in-memory
//! duplex pipe, exercising handshake, pairing, share negotiation, and
//! file transfer without touching the network.

use peersync::handshake::authenticate;
use peersync::identity::DeviceIdentity;
use peersync::peer::PeerManager;
use peersync::registry::{PairedDevice, Profile, ProfileFlags, ProfileRegistry};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{duplex, split};
use uuid::Uuid;

fn paired_from(identity: &DeviceIdentity) -> PairedDevice {
    PairedDevice {
        device_id: identity.device_id(),
        display_name: identity.display_name().to_string(),
        public_key: identity.public_key_bytes(),
        last_address: None,
        paired_at: chrono::Utc::now(),
    }
}

fn profile_with(id: Uuid, root: &Path, flags: ProfileFlags, peer_id: &str) -> Profile {
    Profile {
        id,
        path: root.to_path_buf(),
        name: "shared".into(),
        flags,
        created_at: chrono::Utc::now(),
        shared_with: vec![peer_id.to_string()],
    }
}

/// Handshake both ends of a duplex pipe and hand the halves to the two
/// managers, as the listener would.
async fn connect(a: &PeerManager, b: &PeerManager) {
    let (left, right) = duplex(4 * 1024 * 1024);
    let (mut ar, mut aw) = split(left);
    let (mut br, mut bw) = split(right);

    let (outcome_a, outcome_b) = tokio::join!(
        authenticate(&mut ar, &mut aw, a.identity(), a.registry(), true),
        authenticate(&mut br, &mut bw, b.identity(), b.registry(), false),
    );
    let addr_a: SocketAddr = "127.0.0.1:1111".parse().unwrap();
    let addr_b: SocketAddr = "127.0.0.1:2222".parse().unwrap();

    a.add_connection(Box::new(ar), Box::new(aw), outcome_a.unwrap(), addr_b);
    b.add_connection(Box::new(br), Box::new(bw), outcome_b.unwrap(), addr_a);
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn paired_managers(
    a_root: &Path,
    b_root: &Path,
    profile_id: Uuid,
    a_flags: ProfileFlags,
    b_flags: ProfileFlags,
) -> (PeerManager, PeerManager) {
    let a_identity = DeviceIdentity::generate("a".into());
    let b_identity = DeviceIdentity::generate("b".into());

    let a_registry = ProfileRegistry::new();
    a_registry.bulk_load(
        vec![profile_with(profile_id, a_root, a_flags, &b_identity.device_id())],
        vec![paired_from(&b_identity)],
    );
    let b_registry = ProfileRegistry::new();
    b_registry.bulk_load(
        vec![profile_with(profile_id, b_root, b_flags, &a_identity.device_id())],
        vec![paired_from(&a_identity)],
    );

    (
        PeerManager::new(a_identity, a_registry),
        PeerManager::new(b_identity, b_registry),
    )
}

#[tokio::test]
async fn test_file_syncs_between_paired_devices() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    tokio::fs::write(a_dir.path().join("hello.txt"), b"hello from a")
        .await
        .unwrap();

    let profile_id = Uuid::new_v4();
    let (a, b) = paired_managers(
        a_dir.path(),
        b_dir.path(),
        profile_id,
        ProfileFlags::default(),
        ProfileFlags::default(),
    );
    connect(&a, &b).await;

    let expected = b_dir.path().join("hello.txt");
    wait_for("file to arrive on b", || expected.exists()).await;
    let content = tokio::fs::read(&expected).await.unwrap();
    assert_eq!(content, b"hello from a");
}

#[tokio::test]
async fn test_multi_chunk_file_arrives_intact() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();

    // Three full chunks plus change
    let content: Vec<u8> = (0..(3 * 64 * 1024 + 777)).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(a_dir.path().join("large.bin"), &content)
        .await
        .unwrap();

    let profile_id = Uuid::new_v4();
    let (a, b) = paired_managers(
        a_dir.path(),
        b_dir.path(),
        profile_id,
        ProfileFlags::default(),
        ProfileFlags::default(),
    );
    connect(&a, &b).await;

    let expected = b_dir.path().join("large.bin");
    wait_for("large file to arrive on b", || expected.exists()).await;
    let received = tokio::fs::read(&expected).await.unwrap();
    assert_eq!(received, content);
}

#[tokio::test]
async fn test_receive_disabled_blocks_transfer() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    tokio::fs::write(a_dir.path().join("x.txt"), b"ten bytes!")
        .await
        .unwrap();

    let mut b_flags = ProfileFlags::default();
    b_flags.allow_receive = false;

    let profile_id = Uuid::new_v4();
    let (a, b) = paired_managers(
        a_dir.path(),
        b_dir.path(),
        profile_id,
        ProfileFlags::default(),
        b_flags,
    );
    connect(&a, &b).await;

    // Give the sessions ample time to negotiate and (not) transfer
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!b_dir.path().join("x.txt").exists());
    assert!(!b_dir.path().join("x.txt.psync-part").exists());

    // The refusal must not have cost either session
    assert!(a.is_connected(&b.identity().device_id()));
    assert!(b.is_connected(&a.identity().device_id()));
}

#[tokio::test]
async fn test_conflict_resolves_to_later_timestamp() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();

    // B's copy is older (written first), A's is newer
    tokio::fs::write(b_dir.path().join("notes.txt"), b"old and much longer content")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    tokio::fs::write(a_dir.path().join("notes.txt"), b"new")
        .await
        .unwrap();

    let profile_id = Uuid::new_v4();
    let (a, b) = paired_managers(
        a_dir.path(),
        b_dir.path(),
        profile_id,
        ProfileFlags::default(),
        ProfileFlags::default(),
    );
    connect(&a, &b).await;

    wait_for("b's copy to be overwritten", || {
        std::fs::read(b_dir.path().join("notes.txt"))
            .map(|c| c == b"new")
            .unwrap_or(false)
    })
    .await;

    // A's copy stays untouched
    let a_content = tokio::fs::read(a_dir.path().join("notes.txt")).await.unwrap();
    assert_eq!(a_content, b"new");
}

#[tokio::test]
async fn test_first_contact_pairing_flow() {
    let a_identity = DeviceIdentity::generate("a".into());
    let b_identity = DeviceIdentity::generate("b".into());
    let a_id = a_identity.device_id();
    let b_id = b_identity.device_id();

    let a = PeerManager::new(a_identity, ProfileRegistry::new());
    let b = PeerManager::new(b_identity, ProfileRegistry::new());

    // Unpaired handshake parks both sides in pending state
    connect(&a, &b).await;
    wait_for("pending pairing on both sides", || {
        !a.pending_pairings().is_empty() && !b.pending_pairings().is_empty()
    })
    .await;

    // A's user asks to pair, B's user accepts
    a.request_pairing(&b_id);
    b.confirm_pairing(&a_id, true).unwrap();

    wait_for("pairings to complete", || {
        a.registry().is_paired(&b_id) && b.registry().is_paired(&a_id)
    })
    .await;

    // The pinned keys must be the real ones
    let pinned_on_a = a.registry().paired_device(&b_id).unwrap();
    assert_eq!(pinned_on_a.public_key, b.identity().public_key_bytes());

    // The parked connection was promoted to a working session
    wait_for("sessions to establish", || {
        a.is_connected(&b_id) && b.is_connected(&a_id)
    })
    .await;
}

#[tokio::test]
async fn test_pairing_rejection_leaves_no_trace() {
    let a_identity = DeviceIdentity::generate("a".into());
    let b_identity = DeviceIdentity::generate("b".into());
    let a_id = a_identity.device_id();
    let b_id = b_identity.device_id();

    let a = PeerManager::new(a_identity, ProfileRegistry::new());
    let b = PeerManager::new(b_identity, ProfileRegistry::new());

    connect(&a, &b).await;
    wait_for("pending pairing on b", || !b.pending_pairings().is_empty()).await;

    b.confirm_pairing(&a_id, false).unwrap();

    wait_for("pending entries to clear", || {
        a.pending_pairings().is_empty() && b.pending_pairings().is_empty()
    })
    .await;
    assert!(!a.registry().is_paired(&b_id));
    assert!(!b.registry().is_paired(&a_id));
    assert!(!a.is_connected(&b_id));
    assert!(!b.is_connected(&a_id));
}

#[tokio::test]
async fn test_unshare_cancels_only_that_profile() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    let a_keep = TempDir::new().unwrap();
    let b_keep = TempDir::new().unwrap();
    tokio::fs::write(a_dir.path().join("dropped.txt"), b"dropped")
        .await
        .unwrap();
    tokio::fs::write(a_keep.path().join("kept.txt"), b"kept")
        .await
        .unwrap();

    let a_identity = DeviceIdentity::generate("a".into());
    let b_identity = DeviceIdentity::generate("b".into());
    let a_id = a_identity.device_id();
    let b_id = b_identity.device_id();

    let unshared_id = Uuid::new_v4();
    let kept_id = Uuid::new_v4();

    let a_registry = ProfileRegistry::new();
    a_registry.bulk_load(
        vec![
            profile_with(unshared_id, a_dir.path(), ProfileFlags::default(), &b_id),
            profile_with(kept_id, a_keep.path(), ProfileFlags::default(), &b_id),
        ],
        vec![paired_from(&b_identity)],
    );
    let b_registry = ProfileRegistry::new();
    b_registry.bulk_load(
        vec![
            profile_with(unshared_id, b_dir.path(), ProfileFlags::default(), &a_id),
            profile_with(kept_id, b_keep.path(), ProfileFlags::default(), &a_id),
        ],
        vec![paired_from(&a_identity)],
    );

    let a = PeerManager::new(a_identity, a_registry);
    let b = PeerManager::new(b_identity, b_registry);

    connect(&a, &b).await;
    wait_for("both profiles to sync", || {
        b_dir.path().join("dropped.txt").exists() && b_keep.path().join("kept.txt").exists()
    })
    .await;

    // Drop one share mid-session, then change both profiles locally
    a.unshare_profile(unshared_id, &b_id);
    tokio::fs::write(a_dir.path().join("after.txt"), b"should not sync")
        .await
        .unwrap();
    tokio::fs::write(a_keep.path().join("after.txt"), b"should sync")
        .await
        .unwrap();
    a.notify_local_change(unshared_id);
    a.notify_local_change(kept_id);

    // The surviving share keeps flowing over the same session
    wait_for("kept profile to keep syncing", || {
        b_keep.path().join("after.txt").exists()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!b_dir.path().join("after.txt").exists());
    assert!(a.is_connected(&b_id));
    assert!(b.is_connected(&a_id));
}

#[tokio::test]
async fn test_empty_directory_propagates() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    tokio::fs::create_dir(a_dir.path().join("empty-dir"))
        .await
        .unwrap();

    let profile_id = Uuid::new_v4();
    let (a, b) = paired_managers(
        a_dir.path(),
        b_dir.path(),
        profile_id,
        ProfileFlags::default(),
        ProfileFlags::default(),
    );
    connect(&a, &b).await;

    let expected = b_dir.path().join("empty-dir");
    wait_for("empty directory to appear on b", || expected.is_dir()).await;
}
