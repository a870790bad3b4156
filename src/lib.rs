//! # peersync
//!
//! A peer-to-peer directory synchronization engine. peersync discovers
//! other instances on the local network, authenticates them with a
//! persistent Ed25519 device identity, negotiates which directories
//! ("profiles") two paired devices exchange, and streams files between
//! them under explicit per-profile permissions.
//!
//! ## Core Modules
//!
//! - [`identity`] - Persistent device identity and challenge signing
//! - [`registry`] - Profiles, paired devices, and change notifications
//! - [`config`] - TOML persistence of node settings and registry state
//! - [`discovery`] - UDP presence announcements and the candidate table
//! - [`wire`] - Length-prefixed framed session protocol
//! - [`handshake`] - Mutual authentication on every connection
//! - [`listener`] - QUIC transport endpoint (accept + dial)
//! - [`peer`] - Sessions, pairing, share negotiation, scheduling
//! - [`transfer`] - Reconciliation and resumable chunked streaming
//! - [`progress`] - Aggregated transfer progress snapshots
//! - [`watcher`] - Debounced local change detection
//! - [`engine`] - Daemon assembly wiring the services together

pub mod cli;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod listener;
pub mod peer;
pub mod progress;
pub mod registry;
pub mod transfer;
pub mod watcher;
pub mod wire;

pub use config::Config;
pub use error::SyncError;
pub use identity::DeviceIdentity;
pub use peer::PeerManager;
pub use registry::ProfileRegistry;
