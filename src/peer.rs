//! # Peer Manager
//!
//! Central coordinator for everything that happens after a handshake:
//! one logical session per paired device, the pending-pairing queue for
//! first contacts, profile-share negotiation, transfer scheduling, and
//! session health.
//!
//! Connection races (simultaneous inbound + outbound to the same device)
//! are resolved deterministically: the connection whose handshake
//! completed last wins and the older session is closed. Sessions exchange
//! `ProfileAnnounce` messages carrying each side's shared profiles and
//! directory indexes; the active share set is the intersection of what
//! both sides declare. Transfers are scheduled round-robin across shares
//! (oldest task first within a share) so one large profile cannot starve
//! the others.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::handshake::HandshakeOutcome;
use crate::identity::DeviceIdentity;
use crate::progress::TaskProgress;
use crate::registry::{PairedDevice, Profile, ProfileRegistry};
use crate::transfer::{self, Direction, IncomingFile, TransferTask};
use crate::wire::{
    read_frame, write_frame, IndexEntry, ShareAnnounce, TaskKind, WireMessage, CHUNK_SIZE,
};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Keep-alive is sent after this much write silence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// A session with no inbound traffic for this long is torn down.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
/// Unconfirmed pairings are dropped after this long.
pub const PENDING_PAIRING_TIMEOUT: Duration = Duration::from_secs(300);

/// Notifications for external collaborators (persistence, UI).
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A not-yet-paired device authenticated and awaits user confirmation.
    PairingRequested { device_id: String, display_name: String },
    PairingRejected { device_id: String },
    PairAdded { device_id: String },
    SessionEstablished { device_id: String },
    SessionLost { device_id: String, reason: String },
    ShareActivated { profile_id: Uuid, device_id: String },
    ShareDeactivated { profile_id: Uuid, device_id: String },
    TransferCompleted { profile_id: Uuid, device_id: String, path: String },
    /// The manager wants an outbound connection to this device; the
    /// owner of the endpoint and discovery table performs the dial.
    DialRequested { device_id: String },
}

/// A pending first-contact pairing, surfaced for user confirmation.
#[derive(Debug, Clone)]
pub struct PendingPairing {
    pub device_id: String,
    pub display_name: String,
    pub address: SocketAddr,
}

enum SessionCommand {
    /// Re-scan shared profiles, announce them, and re-reconcile.
    Announce,
    /// A local path disappeared; queue a delete notice for the peer.
    LocalDeleted { profile_id: Uuid, path: String, is_dir: bool },
    /// Cancel every task belonging to this profile and deactivate it.
    Unshare(Uuid),
}

enum PendingCommand {
    Decision(bool),
}

type FrameResult = Result<WireMessage, String>;
type Inbound = mpsc::Receiver<FrameResult>;

struct SessionHandle {
    seq: u64,
    display_name: String,
    address: SocketAddr,
    commands: mpsc::UnboundedSender<SessionCommand>,
    progress: Arc<RwLock<HashMap<Uuid, TaskProgress>>>,
    task: JoinHandle<()>,
}

struct PendingHandle {
    display_name: String,
    address: SocketAddr,
    commands: mpsc::UnboundedSender<PendingCommand>,
    task: JoinHandle<()>,
}

struct PeerInner {
    identity: DeviceIdentity,
    registry: ProfileRegistry,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    pending: RwLock<HashMap<String, PendingHandle>>,
    /// Devices the local user asked to pair with; first contact with
    /// them is auto-accepted on our side.
    wanted: RwLock<HashSet<String>>,
    events: broadcast::Sender<PeerEvent>,
    session_seq: AtomicU64,
}

#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<PeerInner>,
}

impl PeerManager {
    pub fn new(identity: DeviceIdentity, registry: ProfileRegistry) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(PeerInner {
                identity,
                registry,
                sessions: RwLock::new(HashMap::new()),
                pending: RwLock::new(HashMap::new()),
                wanted: RwLock::new(HashSet::new()),
                events,
                session_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.inner.registry
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Hand over an authenticated channel (from the listener or an
    /// outbound dial). Trusted outcomes become sessions immediately;
    /// unknown devices are parked in the pending-pairing queue.
    pub fn add_connection(
        &self,
        reader: BoxReader,
        writer: BoxWriter,
        outcome: HandshakeOutcome,
        address: SocketAddr,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let pump = PumpGuard(spawn_frame_pump(reader, inbound_tx));

        if outcome.trusted {
            // Refresh the stored name/address on every successful handshake
            self.inner
                .registry
                .touch_pairing(&outcome.device_id, &outcome.display_name, address);
            self.start_session(inbound_rx, pump, writer, outcome, address);
        } else {
            self.start_pending(inbound_rx, pump, writer, outcome, address);
        }
    }

    /// Ask to pair with a device seen in discovery. If the device has
    /// already contacted us the pending pairing is accepted; otherwise a
    /// dial is requested and first contact will be auto-accepted locally.
    pub fn request_pairing(&self, device_id: &str) {
        self.inner.wanted.write().insert(device_id.to_string());
        let pending = self
            .inner
            .pending
            .read()
            .get(device_id)
            .map(|p| p.commands.clone());
        match pending {
            Some(commands) => {
                let _ = commands.send(PendingCommand::Decision(true));
            }
            None => self.emit(PeerEvent::DialRequested {
                device_id: device_id.to_string(),
            }),
        }
    }

    /// Resolve a pending pairing, accepting or rejecting the device.
    pub fn confirm_pairing(&self, device_id: &str, accept: bool) -> Result<(), SyncError> {
        let commands = self
            .inner
            .pending
            .read()
            .get(device_id)
            .map(|p| p.commands.clone())
            .ok_or_else(|| SyncError::Protocol(format!("no pending pairing for {device_id}")))?;
        commands
            .send(PendingCommand::Decision(accept))
            .map_err(|_| SyncError::Protocol("pending pairing already closed".into()))
    }

    pub fn pending_pairings(&self) -> Vec<PendingPairing> {
        self.inner
            .pending
            .read()
            .iter()
            .map(|(id, p)| PendingPairing {
                device_id: id.clone(),
                display_name: p.display_name.clone(),
                address: p.address,
            })
            .collect()
    }

    /// Share a profile with a paired device and renegotiate.
    pub fn share_profile(&self, profile_id: Uuid, device_id: &str) -> Result<(), SyncError> {
        if self.inner.registry.paired_device(device_id).is_none() {
            return Err(SyncError::Protocol(format!("{device_id} is not paired")));
        }
        if !self.inner.registry.share_profile(profile_id, device_id) {
            debug!("Profile {} already shared with {}", profile_id, device_id);
        }
        self.send_session_command(device_id, SessionCommand::Announce);
        Ok(())
    }

    /// Stop sharing a profile with a device; only that share's tasks are
    /// cancelled, the session stays up.
    pub fn unshare_profile(&self, profile_id: Uuid, device_id: &str) {
        self.inner.registry.unshare_profile(profile_id, device_id);
        self.send_session_command(device_id, SessionCommand::Unshare(profile_id));
    }

    /// Remove a pairing entirely: close its session, drop pending state,
    /// and forget the pinned key.
    pub fn unpair(&self, device_id: &str) {
        self.inner.wanted.write().remove(device_id);
        if let Some(handle) = self.inner.pending.write().remove(device_id) {
            handle.task.abort();
        }
        self.close_session(device_id, "pairing removed");
        self.inner.registry.remove_pairing(device_id);
    }

    /// Local watcher noticed content changes under a profile.
    pub fn notify_local_change(&self, profile_id: Uuid) {
        for device_id in self.devices_sharing(profile_id) {
            self.send_session_command(&device_id, SessionCommand::Announce);
        }
    }

    /// Local watcher noticed a deletion under a profile.
    pub fn notify_local_delete(&self, profile_id: Uuid, path: String, is_dir: bool) {
        for device_id in self.devices_sharing(profile_id) {
            self.send_session_command(
                &device_id,
                SessionCommand::LocalDeleted {
                    profile_id,
                    path: path.clone(),
                    is_dir,
                },
            );
        }
    }

    /// Devices with an established session right now.
    pub fn connected_devices(&self) -> Vec<(String, String, SocketAddr)> {
        self.inner
            .sessions
            .read()
            .iter()
            .map(|(id, s)| (id.clone(), s.display_name.clone(), s.address))
            .collect()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.inner.sessions.read().contains_key(device_id)
    }

    /// Point-in-time view of every active transfer task, for the
    /// progress tracker.
    pub fn transfer_snapshot(&self) -> Vec<TaskProgress> {
        let sessions = self.inner.sessions.read();
        let mut tasks = Vec::new();
        for handle in sessions.values() {
            tasks.extend(handle.progress.read().values().cloned());
        }
        tasks
    }

    fn devices_sharing(&self, profile_id: Uuid) -> Vec<String> {
        self.inner
            .registry
            .profile(profile_id)
            .map(|p| p.shared_with)
            .unwrap_or_default()
    }

    fn send_session_command(&self, device_id: &str, command: SessionCommand) {
        if let Some(handle) = self.inner.sessions.read().get(device_id) {
            let _ = handle.commands.send(command);
        }
    }

    fn close_session(&self, device_id: &str, reason: &str) {
        let handle = self.inner.sessions.write().remove(device_id);
        if let Some(handle) = handle {
            handle.task.abort();
            self.emit(PeerEvent::SessionLost {
                device_id: device_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    fn start_session(
        &self,
        inbound_rx: Inbound,
        pump: PumpGuard,
        writer: BoxWriter,
        outcome: HandshakeOutcome,
        address: SocketAddr,
    ) {
        let seq = self.inner.session_seq.fetch_add(1, Ordering::SeqCst);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let progress = Arc::new(RwLock::new(HashMap::new()));

        let runner = SessionRunner {
            mgr: self.clone(),
            device_id: outcome.device_id.clone(),
            progress: progress.clone(),
            shares: HashMap::new(),
            remote_shares: HashMap::new(),
            rotation: VecDeque::new(),
            outgoing: None,
            incoming: HashMap::new(),
        };
        // The loop must not run (and possibly finish) before its handle
        // is registered, so it waits for the ready signal
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(run_session(
            runner, inbound_rx, pump, writer, command_rx, seq, ready_rx,
        ));

        let handle = SessionHandle {
            seq,
            display_name: outcome.display_name.clone(),
            address,
            commands,
            progress,
            task,
        };

        // Last completed handshake wins a connection race
        let old = self
            .inner
            .sessions
            .write()
            .insert(outcome.device_id.clone(), handle);
        if let Some(old) = old {
            debug!(
                "Replacing duplicate session {} with {} for {}",
                old.seq, seq, outcome.device_id
            );
            old.task.abort();
        }
        let _ = ready_tx.send(());

        info!(
            "Session established with {} ({})",
            outcome.device_id, outcome.display_name
        );
        self.emit(PeerEvent::SessionEstablished {
            device_id: outcome.device_id,
        });
    }

    /// Session loop ended; drop the handle if it is still the current one.
    fn finish_session(&self, device_id: &str, seq: u64, reason: String) {
        let removed = {
            let mut sessions = self.inner.sessions.write();
            match sessions.get(device_id) {
                Some(handle) if handle.seq == seq => {
                    sessions.remove(device_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!("Session with {} lost: {}", device_id, reason);
            self.emit(PeerEvent::SessionLost {
                device_id: device_id.to_string(),
                reason,
            });
        }
    }

    fn start_pending(
        &self,
        inbound_rx: Inbound,
        pump: PumpGuard,
        writer: BoxWriter,
        outcome: HandshakeOutcome,
        address: SocketAddr,
    ) {
        let locally_wanted = self.inner.wanted.read().contains(&outcome.device_id);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(run_pending(
            self.clone(),
            inbound_rx,
            pump,
            writer,
            outcome.clone(),
            address,
            locally_wanted,
            command_rx,
            ready_rx,
        ));

        let handle = PendingHandle {
            display_name: outcome.display_name.clone(),
            address,
            commands,
            task,
        };
        let old = self
            .inner
            .pending
            .write()
            .insert(outcome.device_id.clone(), handle);
        if let Some(old) = old {
            old.task.abort();
        }
        let _ = ready_tx.send(());

        if !locally_wanted {
            info!(
                "Pairing requested by unknown device {} ({})",
                outcome.device_id, outcome.display_name
            );
            self.emit(PeerEvent::PairingRequested {
                device_id: outcome.device_id,
                display_name: outcome.display_name,
            });
        }
    }

    fn drop_pending(&self, device_id: &str, rejected: bool) {
        // Called from within the pending task itself, so the handle is
        // removed without aborting it
        self.inner.pending.write().remove(device_id);
        self.inner.wanted.write().remove(device_id);
        if rejected {
            self.emit(PeerEvent::PairingRejected {
                device_id: device_id.to_string(),
            });
        }
    }

    /// Both sides accepted: pin the key, persist the pairing, and turn
    /// the parked connection into a live session.
    fn complete_pairing(
        &self,
        inbound_rx: Inbound,
        pump: PumpGuard,
        writer: BoxWriter,
        outcome: HandshakeOutcome,
        address: SocketAddr,
    ) {
        self.inner.pending.write().remove(&outcome.device_id);
        self.inner.wanted.write().remove(&outcome.device_id);

        self.inner.registry.add_pairing(PairedDevice {
            device_id: outcome.device_id.clone(),
            display_name: outcome.display_name.clone(),
            public_key: outcome.public_key.to_bytes(),
            last_address: Some(address),
            paired_at: chrono::Utc::now(),
        });
        info!("Paired with {} ({})", outcome.device_id, outcome.display_name);
        self.emit(PeerEvent::PairAdded {
            device_id: outcome.device_id.clone(),
        });

        let outcome = HandshakeOutcome {
            trusted: true,
            ..outcome
        };
        self.start_session(inbound_rx, pump, writer, outcome, address);
    }
}

struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Pump frames off a reader into a channel so the owning loop can
/// `select!` without losing partially-read frames on cancellation.
fn spawn_frame_pump(mut reader: BoxReader, tx: mpsc::Sender<FrameResult>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(message) => {
                    if tx.send(Ok(message)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e.to_string())).await;
                    return;
                }
            }
        }
    })
}

/// Parked connection for an authenticated but unpaired device.
///
/// Keep-alives flow in both directions while the users decide; the first
/// rejection or the pending timeout closes the channel.
#[allow(clippy::too_many_arguments)]
async fn run_pending(
    mgr: PeerManager,
    mut inbound_rx: Inbound,
    pump: PumpGuard,
    mut writer: BoxWriter,
    outcome: HandshakeOutcome,
    address: SocketAddr,
    locally_wanted: bool,
    mut command_rx: mpsc::UnboundedReceiver<PendingCommand>,
    ready_rx: tokio::sync::oneshot::Receiver<()>,
) {
    if ready_rx.await.is_err() {
        return;
    }
    let device_id = outcome.device_id.clone();
    let mut local_accepted = locally_wanted;
    let mut remote_accepted = false;
    let started = Instant::now();

    if local_accepted
        && write_frame(&mut writer, &WireMessage::PairingDecision { accepted: true })
            .await
            .is_err()
    {
        mgr.drop_pending(&device_id, false);
        return;
    }

    let mut ticker = interval(KEEPALIVE_INTERVAL);
    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(PendingCommand::Decision(accept)) => {
                        let _ = write_frame(
                            &mut writer,
                            &WireMessage::PairingDecision { accepted: accept },
                        )
                        .await;
                        if !accept {
                            mgr.drop_pending(&device_id, true);
                            return;
                        }
                        local_accepted = true;
                    }
                    None => {
                        mgr.drop_pending(&device_id, false);
                        return;
                    }
                }
            }
            frame = inbound_rx.recv() => {
                match frame {
                    Some(Ok(WireMessage::PairingDecision { accepted: true })) => {
                        remote_accepted = true;
                    }
                    Some(Ok(WireMessage::PairingDecision { accepted: false })) => {
                        info!("Device {} declined pairing", device_id);
                        mgr.drop_pending(&device_id, true);
                        return;
                    }
                    Some(Ok(WireMessage::KeepAlive)) => {}
                    Some(Ok(other)) => {
                        warn!(
                            "Unexpected {} from unpaired device {}, dropping connection",
                            other.kind_name(),
                            device_id
                        );
                        mgr.drop_pending(&device_id, false);
                        return;
                    }
                    Some(Err(_)) | None => {
                        mgr.drop_pending(&device_id, false);
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if started.elapsed() > PENDING_PAIRING_TIMEOUT {
                    info!("Pairing with {} timed out unconfirmed", device_id);
                    mgr.drop_pending(&device_id, false);
                    return;
                }
                let _ = write_frame(&mut writer, &WireMessage::KeepAlive).await;
            }
        }

        if local_accepted && remote_accepted {
            mgr.complete_pairing(inbound_rx, pump, writer, outcome, address);
            return;
        }
    }
}

/// Per-share session state.
struct ShareState {
    profile: Profile,
    remote_index: BTreeMap<String, IndexEntry>,
    queue: VecDeque<TransferTask>,
    /// Receive-direction tasks we expect offers for, keyed by path.
    expected_receives: HashMap<String, TransferTask>,
}

struct OutgoingTransfer {
    task: TransferTask,
    accepted: bool,
}

struct IncomingTransfer {
    task: TransferTask,
    file: IncomingFile,
}

struct SessionRunner {
    mgr: PeerManager,
    device_id: String,
    progress: Arc<RwLock<HashMap<Uuid, TaskProgress>>>,
    shares: HashMap<Uuid, ShareState>,
    remote_shares: HashMap<Uuid, ShareAnnounce>,
    rotation: VecDeque<Uuid>,
    outgoing: Option<OutgoingTransfer>,
    incoming: HashMap<Uuid, IncomingTransfer>,
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    mut runner: SessionRunner,
    mut inbound_rx: Inbound,
    _pump: PumpGuard,
    mut writer: BoxWriter,
    mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    seq: u64,
    ready_rx: tokio::sync::oneshot::Receiver<()>,
) {
    if ready_rx.await.is_err() {
        return;
    }
    let device_id = runner.device_id.clone();
    let mgr = runner.mgr.clone();

    let mut last_read = Instant::now();
    let mut last_write = Instant::now();

    // Opening announce: tell the peer what we share with it
    if let Err(e) = runner.sync_state(Some(&mut writer)).await {
        mgr.finish_session(&device_id, seq, format!("initial announce failed: {e}"));
        return;
    }

    let mut ticker = interval(Duration::from_secs(1));
    let reason = loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(SessionCommand::Announce) => {
                        if let Err(e) = runner.sync_state(Some(&mut writer)).await {
                            break format!("announce failed: {e}");
                        }
                        last_write = Instant::now();
                    }
                    Some(SessionCommand::LocalDeleted { profile_id, path, is_dir }) => {
                        runner.queue_delete(profile_id, path, is_dir);
                    }
                    Some(SessionCommand::Unshare(profile_id)) => {
                        if let Err(e) = runner.deactivate_share(profile_id, &mut writer).await {
                            break format!("unshare failed: {e}");
                        }
                        last_write = Instant::now();
                    }
                    None => break "manager dropped".to_string(),
                }
            }
            frame = inbound_rx.recv() => {
                match frame {
                    Some(Ok(message)) => {
                        last_read = Instant::now();
                        match runner.handle_message(message, &mut writer).await {
                            Ok(()) => { last_write = Instant::now(); }
                            Err(e) if e.is_fatal_for_connection() => break e.to_string(),
                            Err(e) => warn!("Session {}: {}", device_id, e),
                        }
                    }
                    Some(Err(e)) => break format!("connection error: {e}"),
                    None => break "connection closed".to_string(),
                }
            }
            _ = ticker.tick() => {
                if last_read.elapsed() > SESSION_TIMEOUT {
                    break "keep-alive timeout".to_string();
                }
                if last_write.elapsed() > KEEPALIVE_INTERVAL {
                    if write_frame(&mut writer, &WireMessage::KeepAlive).await.is_err() {
                        break "write failed".to_string();
                    }
                    last_write = Instant::now();
                }
            }
        }

        // Keep the pipeline busy whenever nothing is streaming
        if runner.outgoing.is_none() {
            match runner.start_next_transfer(&mut writer).await {
                Ok(true) => last_write = Instant::now(),
                Ok(false) => {}
                Err(e) => break format!("transfer dispatch failed: {e}"),
            }
        }
    };

    mgr.finish_session(&device_id, seq, reason);
}

impl SessionRunner {
    /// Scan shared profiles, optionally announce them to the peer, and
    /// re-derive every active share's task set from the fresh listings.
    ///
    /// Inbound announces call this without a writer: replying with our
    /// own announce would ping-pong forever.
    async fn sync_state(&mut self, writer: Option<&mut BoxWriter>) -> anyhow::Result<()> {
        let profiles = self.mgr.inner.registry.profiles_shared_with(&self.device_id);

        let mut announces = Vec::with_capacity(profiles.len());
        let mut local_indexes = HashMap::new();
        for profile in &profiles {
            let index = transfer::scan_tree(&profile.path, profile.flags.skip_hidden)
                .await
                .unwrap_or_else(|e| {
                    warn!("Failed to scan {}: {}", profile.path.display(), e);
                    BTreeMap::new()
                });
            announces.push(ShareAnnounce {
                profile_id: profile.id,
                flags: profile.flags,
                index: index.values().cloned().collect(),
            });
            local_indexes.insert(profile.id, index);
        }
        if let Some(writer) = writer {
            write_frame(writer, &WireMessage::ProfileAnnounce { shares: announces }).await?;
        }

        self.rebuild_shares(profiles, local_indexes);
        Ok(())
    }

    /// Recompute the active share set as the intersection of both sides'
    /// declarations, then reconcile each active share.
    fn rebuild_shares(
        &mut self,
        local_profiles: Vec<Profile>,
        mut local_indexes: HashMap<Uuid, BTreeMap<String, IndexEntry>>,
    ) {
        let previously_active: HashSet<Uuid> = self.shares.keys().copied().collect();
        let mut now_active = HashSet::new();

        for profile in local_profiles {
            let remote_index = match self.remote_shares.get(&profile.id) {
                Some(remote) => transfer::index_to_map(&remote.index),
                None => continue,
            };
            now_active.insert(profile.id);
            let local_index = local_indexes.remove(&profile.id).unwrap_or_default();

            let tasks =
                transfer::plan_tasks(&profile, &self.device_id, &local_index, &remote_index);

            // Derived from scratch each time; drop superseded bookkeeping
            self.clear_share_progress(profile.id, true);
            let in_flight_path = self
                .outgoing
                .as_ref()
                .filter(|o| o.task.profile_id == profile.id)
                .map(|o| o.task.path.clone());

            let mut queue = VecDeque::new();
            let mut expected_receives = HashMap::new();
            for task in tasks {
                if Some(&task.path) == in_flight_path.as_ref() {
                    continue;
                }
                self.track_progress(&task);
                match task.direction {
                    Direction::Send => queue.push_back(task),
                    Direction::Receive => {
                        expected_receives.insert(task.path.clone(), task);
                    }
                }
            }

            let device_id = self.device_id.clone();
            let share = self.shares.entry(profile.id).or_insert_with(|| ShareState {
                profile: profile.clone(),
                remote_index: BTreeMap::new(),
                queue: VecDeque::new(),
                expected_receives: HashMap::new(),
            });
            share.profile = profile.clone();
            share.remote_index = remote_index;
            share.queue = queue;
            share.expected_receives = expected_receives;

            if !previously_active.contains(&profile.id) {
                self.mgr.emit(PeerEvent::ShareActivated {
                    profile_id: profile.id,
                    device_id,
                });
            }
        }

        for dropped in previously_active.difference(&now_active) {
            self.shares.remove(dropped);
            self.clear_share_progress(*dropped, false);
            self.mgr.emit(PeerEvent::ShareDeactivated {
                profile_id: *dropped,
                device_id: self.device_id.clone(),
            });
        }

        self.rotation = self.shares.keys().copied().collect();
    }

    fn track_progress(&self, task: &TransferTask) {
        self.progress.write().insert(
            task.id,
            TaskProgress {
                task_id: task.id,
                profile_id: task.profile_id,
                device_id: task.device_id.clone(),
                path: task.path.clone(),
                direction: task.direction,
                total_bytes: task.total_bytes,
                completed_bytes: task.completed_bytes,
            },
        );
    }

    fn update_progress(&self, task_id: Uuid, completed_bytes: u64) {
        if let Some(entry) = self.progress.write().get_mut(&task_id) {
            entry.completed_bytes = completed_bytes.min(entry.total_bytes);
        }
    }

    fn drop_progress(&self, task_id: Uuid) {
        self.progress.write().remove(&task_id);
    }

    /// Remove progress entries for a share, optionally sparing whatever
    /// is actively streaming.
    fn clear_share_progress(&self, profile_id: Uuid, keep_in_flight: bool) {
        let in_flight: HashSet<Uuid> = if keep_in_flight {
            self.outgoing
                .iter()
                .map(|o| o.task.id)
                .chain(self.incoming.values().map(|i| i.task.id))
                .collect()
        } else {
            HashSet::new()
        };
        self.progress
            .write()
            .retain(|id, p| p.profile_id != profile_id || in_flight.contains(id));
    }

    /// Take the in-flight outgoing transfer if it matches.
    fn take_outgoing(&mut self, task_id: Uuid) -> Option<OutgoingTransfer> {
        match self.outgoing.take() {
            Some(outgoing) if outgoing.task.id == task_id => Some(outgoing),
            other => {
                self.outgoing = other;
                None
            }
        }
    }

    fn queue_delete(&mut self, profile_id: Uuid, path: String, is_dir: bool) {
        let device_id = self.device_id.clone();
        let Some(share) = self.shares.get_mut(&profile_id) else {
            return;
        };
        let task = TransferTask {
            id: Uuid::new_v4(),
            profile_id,
            device_id,
            path,
            kind: if is_dir { TaskKind::RmDir } else { TaskKind::Delete },
            direction: Direction::Send,
            total_bytes: 0,
            completed_bytes: 0,
            mtime_ms: 0,
            hash: None,
        };
        share.queue.push_back(task.clone());
        self.track_progress(&task);
    }

    /// Cancel exactly the tasks of one share and tell the peer we no
    /// longer offer it.
    async fn deactivate_share(
        &mut self,
        profile_id: Uuid,
        writer: &mut BoxWriter,
    ) -> anyhow::Result<()> {
        if self.shares.remove(&profile_id).is_some() {
            self.clear_share_progress(profile_id, false);
            self.rotation.retain(|id| *id != profile_id);
            self.incoming.retain(|_, i| i.task.profile_id != profile_id);

            let cancelled = self
                .outgoing
                .as_ref()
                .filter(|o| o.task.profile_id == profile_id)
                .map(|o| o.task.id);
            if let Some(task_id) = cancelled {
                self.outgoing = None;
                write_frame(
                    writer,
                    &WireMessage::TransferFailed {
                        task_id,
                        reason: "share deactivated".into(),
                    },
                )
                .await?;
            }
            self.mgr.emit(PeerEvent::ShareDeactivated {
                profile_id,
                device_id: self.device_id.clone(),
            });
        }
        // Re-announce so the peer drops the share too
        self.sync_state(Some(writer)).await
    }

    /// Round-robin across shares, oldest task first within a share.
    /// Returns whether anything was written.
    async fn start_next_transfer(&mut self, writer: &mut BoxWriter) -> anyhow::Result<bool> {
        for _ in 0..self.rotation.len() {
            let Some(profile_id) = self.rotation.pop_front() else {
                break;
            };
            self.rotation.push_back(profile_id);

            let task = match self.shares.get_mut(&profile_id) {
                Some(share) => match share.queue.pop_front() {
                    Some(task) => task,
                    None => continue,
                },
                None => continue,
            };

            match task.kind {
                TaskKind::Delete | TaskKind::RmDir => {
                    write_frame(
                        writer,
                        &WireMessage::DeleteNotice {
                            profile_id,
                            path: task.path.clone(),
                            is_dir: task.kind == TaskKind::RmDir,
                        },
                    )
                    .await?;
                    // Fire-and-forget: the peer applies it only if its
                    // own delete permission allows
                    self.drop_progress(task.id);
                    return Ok(true);
                }
                TaskKind::Create | TaskKind::Update | TaskKind::MkDir => {
                    write_frame(
                        writer,
                        &WireMessage::TransferOffer {
                            task_id: task.id,
                            profile_id,
                            path: task.path.clone(),
                            kind: task.kind,
                            size: task.total_bytes,
                            mtime_ms: task.mtime_ms,
                            hash: task.hash,
                        },
                    )
                    .await?;
                    self.outgoing = Some(OutgoingTransfer {
                        task,
                        accepted: false,
                    });
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn handle_message(
        &mut self,
        message: WireMessage,
        writer: &mut BoxWriter,
    ) -> Result<(), SyncError> {
        match message {
            WireMessage::KeepAlive => Ok(()),
            WireMessage::ProfileAnnounce { shares } => {
                self.remote_shares = shares
                    .into_iter()
                    .map(|share| (share.profile_id, share))
                    .collect();
                // Rebuild from the fresh remote view; no reply announce
                self.sync_state(None)
                    .await
                    .map_err(|e| SyncError::Protocol(e.to_string()))
            }
            WireMessage::TransferOffer {
                task_id,
                profile_id,
                path,
                kind,
                size,
                mtime_ms,
                hash,
            } => {
                self.handle_offer(task_id, profile_id, path, kind, size, mtime_ms, hash, writer)
                    .await
            }
            WireMessage::TransferAccept {
                task_id,
                resume_chunk,
            } => self.handle_accept(task_id, resume_chunk, writer).await,
            WireMessage::TransferRefuse { task_id, reason } => {
                if let Some(outgoing) = self.take_outgoing(task_id) {
                    debug!("Peer refused transfer of {:?}: {}", outgoing.task.path, reason);
                    self.drop_progress(task_id);
                }
                Ok(())
            }
            WireMessage::TransferAck { task_id, seq } => {
                self.handle_ack(task_id, seq, writer).await
            }
            WireMessage::TransferChunk { task_id, seq, data } => {
                self.handle_chunk(task_id, seq, data, writer).await
            }
            WireMessage::TransferDone { task_id } => {
                if let Some(outgoing) = self.take_outgoing(task_id) {
                    self.drop_progress(task_id);
                    self.mgr.emit(PeerEvent::TransferCompleted {
                        profile_id: outgoing.task.profile_id,
                        device_id: self.device_id.clone(),
                        path: outgoing.task.path,
                    });
                }
                Ok(())
            }
            WireMessage::TransferFailed { task_id, reason } => {
                if let Some(outgoing) = self.take_outgoing(task_id) {
                    warn!("Peer failed transfer of {:?}: {}", outgoing.task.path, reason);
                }
                self.incoming.remove(&task_id);
                self.drop_progress(task_id);
                Ok(())
            }
            WireMessage::DeleteNotice {
                profile_id,
                path,
                is_dir,
            } => self.handle_delete_notice(profile_id, path, is_dir).await,
            // Handshake traffic after session establishment is a
            // protocol violation
            other => Err(SyncError::Protocol(format!(
                "unexpected {} on established session",
                other.kind_name()
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_offer(
        &mut self,
        task_id: Uuid,
        profile_id: Uuid,
        path: String,
        kind: TaskKind,
        size: u64,
        mtime_ms: i64,
        hash: Option<[u8; 32]>,
        writer: &mut BoxWriter,
    ) -> Result<(), SyncError> {
        // Decide acceptance before touching the disk
        let refusal = {
            let share = self.shares.get(&profile_id);
            match share {
                None => Some("profile not shared here"),
                Some(share) if !share.profile.flags.allow_receive => {
                    Some("receiving not permitted")
                }
                Some(share) if share.profile.flags.skip_hidden && transfer::is_hidden(&path) => {
                    Some("hidden paths excluded")
                }
                // One active task per destination path
                Some(_) if self.incoming.values().any(|i| i.task.path == path) => {
                    Some("path already transferring")
                }
                Some(_) => None,
            }
        };
        if let Some(reason) = refusal {
            return self.refuse(task_id, reason, writer).await;
        }

        let root = match self.shares.get(&profile_id) {
            Some(share) => share.profile.path.clone(),
            None => return Ok(()),
        };

        if kind == TaskKind::MkDir {
            match transfer::apply_mkdir(&root, &path).await {
                Ok(()) => {
                    if let Some(share) = self.shares.get_mut(&profile_id) {
                        if let Some(expected) = share.expected_receives.remove(&path) {
                            self.drop_progress(expected.id);
                        }
                    }
                    self.send(writer, &WireMessage::TransferAccept { task_id, resume_chunk: 0 })
                        .await?;
                    self.send(writer, &WireMessage::TransferDone { task_id }).await?;
                }
                Err(e) => {
                    warn!("mkdir failed for {:?}: {}", path, e);
                    return self.refuse(task_id, "directory creation failed", writer).await;
                }
            }
            return Ok(());
        }

        // Adopt the reconciliation-derived task when one exists so its
        // progress entry carries over; otherwise the offer defines one
        let expected = self
            .shares
            .get_mut(&profile_id)
            .and_then(|share| share.expected_receives.remove(&path));
        let mut task = match expected {
            Some(task) => {
                self.drop_progress(task.id);
                task
            }
            None => TransferTask {
                id: task_id,
                profile_id,
                device_id: self.device_id.clone(),
                path: path.clone(),
                kind,
                direction: Direction::Receive,
                total_bytes: size,
                completed_bytes: 0,
                mtime_ms,
                hash,
            },
        };
        task.id = task_id;
        task.total_bytes = size;
        task.hash = hash;

        match IncomingFile::begin(&root, &path, size).await {
            Ok((file, resume_chunk)) => {
                task.completed_bytes = file.bytes_written();
                self.track_progress(&task);

                self.send(
                    writer,
                    &WireMessage::TransferAccept {
                        task_id,
                        resume_chunk,
                    },
                )
                .await?;

                let incoming = IncomingTransfer { task, file };
                if incoming.file.is_complete() {
                    // Zero-byte file or a fully resumed partial
                    self.finalize_incoming(incoming, writer).await?;
                } else {
                    self.incoming.insert(task_id, incoming);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Cannot accept transfer of {:?}: {}", path, e);
                self.refuse(task_id, "destination not writable", writer).await
            }
        }
    }

    async fn handle_accept(
        &mut self,
        task_id: Uuid,
        resume_chunk: u64,
        writer: &mut BoxWriter,
    ) -> Result<(), SyncError> {
        let advance = {
            let Some(outgoing) = self.outgoing.as_mut().filter(|o| o.task.id == task_id) else {
                return Ok(());
            };
            outgoing.accepted = true;
            outgoing.task.completed_bytes =
                (resume_chunk * CHUNK_SIZE as u64).min(outgoing.task.total_bytes);
            (
                outgoing.task.completed_bytes,
                resume_chunk < outgoing.task.chunk_count(),
            )
        };
        self.update_progress(task_id, advance.0);
        if advance.1 {
            self.send_chunk(task_id, resume_chunk, writer).await
        } else {
            // Nothing left to stream; wait for the peer's done/failed
            Ok(())
        }
    }

    async fn handle_ack(
        &mut self,
        task_id: Uuid,
        seq: u64,
        writer: &mut BoxWriter,
    ) -> Result<(), SyncError> {
        let advance = {
            let Some(outgoing) = self.outgoing.as_mut().filter(|o| o.task.id == task_id) else {
                return Ok(());
            };
            if !outgoing.accepted {
                // An ack for a transfer the peer never accepted
                return Ok(());
            }
            outgoing.task.completed_bytes =
                ((seq + 1) * CHUNK_SIZE as u64).min(outgoing.task.total_bytes);
            (
                outgoing.task.completed_bytes,
                seq + 1 < outgoing.task.chunk_count(),
            )
        };
        self.update_progress(task_id, advance.0);
        if advance.1 {
            self.send_chunk(task_id, seq + 1, writer).await
        } else {
            // All chunks acked; the receiver finalizes and sends done
            Ok(())
        }
    }

    async fn send_chunk(
        &mut self,
        task_id: Uuid,
        seq: u64,
        writer: &mut BoxWriter,
    ) -> Result<(), SyncError> {
        let source = {
            let Some(outgoing) = self.outgoing.as_ref().filter(|o| o.task.id == task_id) else {
                return Ok(());
            };
            self.shares
                .get(&outgoing.task.profile_id)
                .map(|share| (share.profile.path.clone(), outgoing.task.path.clone()))
        };
        let Some((root, path)) = source else {
            self.outgoing = None;
            return Ok(());
        };

        match transfer::read_chunk(&root, &path, seq).await {
            Ok(data) => {
                self.send(writer, &WireMessage::TransferChunk { task_id, seq, data })
                    .await
            }
            Err(e) => {
                // Source unreadable: skip this task, keep the session
                warn!("Failed to read {:?} chunk {}: {}", path, seq, e);
                self.outgoing = None;
                self.drop_progress(task_id);
                self.send(
                    writer,
                    &WireMessage::TransferFailed {
                        task_id,
                        reason: "source unreadable".into(),
                    },
                )
                .await
            }
        }
    }

    async fn handle_chunk(
        &mut self,
        task_id: Uuid,
        seq: u64,
        data: Vec<u8>,
        writer: &mut BoxWriter,
    ) -> Result<(), SyncError> {
        let Some(mut incoming) = self.incoming.remove(&task_id) else {
            // Task was cancelled on this side; tell the sender to stop
            return self
                .send(
                    writer,
                    &WireMessage::TransferFailed {
                        task_id,
                        reason: "unknown transfer".into(),
                    },
                )
                .await;
        };

        if let Err(e) = incoming.file.write_chunk(seq, &data).await {
            warn!("Failed to write chunk for {:?}: {}", incoming.task.path, e);
            self.drop_progress(task_id);
            return self
                .send(
                    writer,
                    &WireMessage::TransferFailed {
                        task_id,
                        reason: "write failed".into(),
                    },
                )
                .await;
        }

        incoming.task.completed_bytes = incoming.file.bytes_written();
        self.update_progress(task_id, incoming.task.completed_bytes);
        self.send(writer, &WireMessage::TransferAck { task_id, seq })
            .await?;

        if incoming.file.is_complete() {
            self.finalize_incoming(incoming, writer).await?;
        } else {
            self.incoming.insert(task_id, incoming);
        }
        Ok(())
    }

    async fn finalize_incoming(
        &mut self,
        incoming: IncomingTransfer,
        writer: &mut BoxWriter,
    ) -> Result<(), SyncError> {
        let task = incoming.task;
        let result = incoming.file.finish(task.hash).await;
        self.drop_progress(task.id);
        match result {
            Ok(()) => {
                self.send(writer, &WireMessage::TransferDone { task_id: task.id })
                    .await?;
                self.mgr.emit(PeerEvent::TransferCompleted {
                    profile_id: task.profile_id,
                    device_id: self.device_id.clone(),
                    path: task.path,
                });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to finalize {:?}: {}", task.path, e);
                self.send(
                    writer,
                    &WireMessage::TransferFailed {
                        task_id: task.id,
                        reason: "finalize failed".into(),
                    },
                )
                .await
            }
        }
    }

    async fn handle_delete_notice(
        &mut self,
        profile_id: Uuid,
        path: String,
        is_dir: bool,
    ) -> Result<(), SyncError> {
        let Some(share) = self.shares.get(&profile_id) else {
            return Ok(());
        };
        match transfer::apply_delete(&share.profile.path, &share.profile.flags, &path, is_dir)
            .await
        {
            Ok(removed) => {
                if removed {
                    debug!("Applied remote deletion of {:?}", path);
                }
                Ok(())
            }
            Err(e) => {
                // Per-task failure; the session continues
                warn!("Failed to apply deletion of {:?}: {}", path, e);
                Ok(())
            }
        }
    }

    async fn refuse(
        &mut self,
        task_id: Uuid,
        reason: &str,
        writer: &mut BoxWriter,
    ) -> Result<(), SyncError> {
        self.send(
            writer,
            &WireMessage::TransferRefuse {
                task_id,
                reason: reason.to_string(),
            },
        )
        .await
    }

    async fn send(&self, writer: &mut BoxWriter, message: &WireMessage) -> Result<(), SyncError> {
        write_frame(writer, message)
            .await
            .map_err(|e| SyncError::SessionLost {
                device_id: self.device_id.clone(),
                reason: e.to_string(),
            })
    }
}
