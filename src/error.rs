//! # Error Taxonomy
//!
//! Engine-level error classification. Each variant maps to a recovery
//! policy: authentication failures always surface and kill the connection,
//! transfer failures skip the single task, session loss discards in-flight
//! work for re-derivation on reconnect, and persistence failures degrade to
//! in-memory operation with a warning.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Signature mismatch or a pinned public key that no longer matches.
    /// Fatal for the connection, never retried silently.
    #[error("authentication failure with {device_id}: {reason}")]
    Authentication { device_id: String, reason: String },

    /// The handshake exchange did not complete within its deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A malformed or out-of-order handshake message.
    #[error("handshake protocol violation: {0}")]
    HandshakeProtocol(String),

    /// Discovery socket failure. Logged, the announce/listen loops keep
    /// running on their next tick.
    #[error("discovery I/O failure: {0}")]
    DiscoveryIo(#[source] std::io::Error),

    /// A single transfer task failed (disk full, permissions, locked
    /// file). The task is skipped; the session and its other tasks
    /// continue.
    #[error("transfer I/O failure on {path}: {source}")]
    TransferIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Received file content did not match the offered hash.
    #[error("integrity check failed for {path}")]
    Integrity { path: PathBuf },

    /// The connection to a peer dropped. In-flight tasks are discarded
    /// and recomputed on reconnect.
    #[error("session with {device_id} lost: {reason}")]
    SessionLost { device_id: String, reason: String },

    /// Config or identity could not be written to durable storage.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Frame or message level wire protocol violation.
    #[error("wire protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Whether the error must tear down the owning connection.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            SyncError::Authentication { .. }
                | SyncError::HandshakeTimeout
                | SyncError::HandshakeProtocol(_)
                | SyncError::SessionLost { .. }
        )
    }
}
