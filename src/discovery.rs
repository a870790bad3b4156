//! # Discovery Service
//!
//! Periodically announces this device on the local network segment over
//! UDP broadcast and listens for announcements from other instances,
//! maintaining a bounded, time-decaying table of reachable candidates.
//!
//! Discovery never authenticates anything. It only supplies address
//! candidates; the Peer Manager decides whether and how to connect.
//! Socket failures are logged and the loops keep running on their next
//! tick, so losing connectivity degrades the service instead of killing
//! the process.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, warn};

use crate::error::SyncError;

/// How often this device announces itself.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);
/// Candidates unseen for this long are evicted.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(60);
/// Upper bound on tracked candidates.
pub const MAX_CANDIDATES: usize = 256;

/// Presence datagram broadcast on the discovery port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceMessage {
    pub device_id: String,
    pub display_name: String,
    pub listen_port: u16,
}

/// A device recently seen on the network.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub device_id: String,
    pub display_name: String,
    pub address: SocketAddr,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Announcing,
}

type CandidateTable = Arc<RwLock<HashMap<String, Candidate>>>;

pub struct DiscoveryService {
    own_device_id: String,
    display_name: String,
    listen_port: u16,
    discovery_port: u16,
    candidates: CandidateTable,
    state: Arc<RwLock<DiscoveryState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryService {
    pub fn new(
        own_device_id: String,
        display_name: String,
        listen_port: u16,
        discovery_port: u16,
    ) -> Self {
        Self {
            own_device_id,
            display_name,
            listen_port,
            discovery_port,
            candidates: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(RwLock::new(DiscoveryState::Idle)),
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.read()
    }

    /// Current candidate set, already freshness-filtered.
    pub fn candidates(&self) -> Vec<Candidate> {
        let now = Instant::now();
        self.candidates
            .read()
            .values()
            .filter(|c| now.duration_since(c.last_seen) < FRESHNESS_WINDOW)
            .cloned()
            .collect()
    }

    pub fn candidate(&self, device_id: &str) -> Option<Candidate> {
        let now = Instant::now();
        self.candidates
            .read()
            .get(device_id)
            .filter(|c| now.duration_since(c.last_seen) < FRESHNESS_WINDOW)
            .cloned()
    }

    /// Start the announce and listen loops.
    pub fn start(&mut self) {
        if *self.state.read() == DiscoveryState::Announcing {
            return;
        }
        *self.state.write() = DiscoveryState::Announcing;

        self.tasks.push(self.spawn_announce_loop());
        self.tasks.push(self.spawn_listen_loop());
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        *self.state.write() = DiscoveryState::Idle;
    }

    fn spawn_announce_loop(&self) -> JoinHandle<()> {
        let message = AnnounceMessage {
            device_id: self.own_device_id.clone(),
            display_name: self.display_name.clone(),
            listen_port: self.listen_port,
        };
        let discovery_port = self.discovery_port;
        let candidates = self.candidates.clone();

        tokio::spawn(async move {
            let mut ticker = interval(ANNOUNCE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = send_announce(&message, discovery_port).await {
                    warn!("Failed to send presence announcement: {}", e);
                }
                evict_stale(&candidates, Instant::now());
            }
        })
    }

    fn spawn_listen_loop(&self) -> JoinHandle<()> {
        let own_device_id = self.own_device_id.clone();
        let discovery_port = self.discovery_port;
        let candidates = self.candidates.clone();

        tokio::spawn(async move {
            loop {
                let socket = match UdpSocket::bind(("0.0.0.0", discovery_port)).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!("Failed to bind discovery port {}: {}", discovery_port, e);
                        tokio::time::sleep(ANNOUNCE_INTERVAL).await;
                        continue;
                    }
                };
                debug!("Listening for presence announcements on port {}", discovery_port);

                let mut buf = [0u8; 2048];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, src)) => {
                            record_announcement(
                                &candidates,
                                &own_device_id,
                                &buf[..len],
                                src,
                                Instant::now(),
                            );
                        }
                        Err(e) => {
                            warn!("Discovery receive failed: {}", e);
                            // Rebind after transient socket errors
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn send_announce(message: &AnnounceMessage, discovery_port: u16) -> Result<(), SyncError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(SyncError::DiscoveryIo)?;
    socket.set_broadcast(true).map_err(SyncError::DiscoveryIo)?;

    let data = serde_json::to_vec(message).map_err(|e| {
        SyncError::DiscoveryIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    let target = SocketAddr::from(([255, 255, 255, 255], discovery_port));
    socket
        .send_to(&data, target)
        .await
        .map_err(SyncError::DiscoveryIo)?;
    debug!("Announced presence to {}", target);
    Ok(())
}

/// Parse a presence datagram and update the candidate table.
///
/// The candidate address combines the datagram's source IP with the
/// announced listen port. Own announcements (broadcast loops back) are
/// ignored, as is anything unparseable.
fn record_announcement(
    candidates: &CandidateTable,
    own_device_id: &str,
    data: &[u8],
    src: SocketAddr,
    now: Instant,
) {
    let message: AnnounceMessage = match serde_json::from_slice(data) {
        Ok(message) => message,
        Err(e) => {
            debug!("Ignoring malformed announcement from {}: {}", src, e);
            return;
        }
    };
    if message.device_id == own_device_id {
        return;
    }

    let address = SocketAddr::new(src.ip(), message.listen_port);
    let mut table = candidates.write();
    if table.len() >= MAX_CANDIDATES && !table.contains_key(&message.device_id) {
        // Table full: drop the announcement rather than grow unbounded
        return;
    }
    debug!("Discovered {} ({}) at {}", message.device_id, message.display_name, address);
    table.insert(
        message.device_id.clone(),
        Candidate {
            device_id: message.device_id,
            display_name: message.display_name,
            address,
            last_seen: now,
        },
    );
}

fn evict_stale(candidates: &CandidateTable, now: Instant) {
    let mut table = candidates.write();
    table.retain(|_, c| now.duration_since(c.last_seen) < FRESHNESS_WINDOW);
}
