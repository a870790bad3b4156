//! # Wire Protocol
//!
//! Framed session protocol spoken between paired devices. Every frame is
//! a big-endian `u32` length prefix followed by a JSON-encoded
//! [`WireMessage`]. The codec is generic over the stream halves so the
//! same code runs over QUIC streams in production and in-memory duplex
//! pipes in tests.
//!
//! The wire format is an internal contract between peersync builds, not a
//! public compatibility surface.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::registry::ProfileFlags;

/// Upper bound on a single frame. Chunks are 64 KiB, so anything near
/// this limit is a protocol violation.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Fixed transfer chunk size.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// What a transfer task does at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Create,
    Update,
    Delete,
    /// Zero-length structural task: create an empty directory.
    MkDir,
    /// Zero-length structural task: remove an (empty) directory.
    RmDir,
}

/// One file or directory in a profile's announced index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub size: u64,
    pub mtime_ms: i64,
    pub hash: Option<[u8; 32]>,
    pub is_dir: bool,
}

/// A profile this device offers to synchronize, with its current index.
///
/// Carrying the directory index on the announce is what gives each side
/// its "last-known remote directory listing".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareAnnounce {
    pub profile_id: Uuid,
    pub flags: ProfileFlags,
    pub index: Vec<IndexEntry>,
}

/// Session protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Identity announcement, first message in both directions.
    Hello {
        device_id: String,
        display_name: String,
        public_key: Vec<u8>,
    },
    /// Random nonce the peer must prove key possession over.
    Challenge { nonce: [u8; 32] },
    /// Ed25519 signature over the challenged nonce.
    Proof { signature: Vec<u8> },
    /// Outcome of a first-contact pairing confirmation.
    PairingDecision { accepted: bool },
    /// Profiles this side currently shares with the peer.
    ProfileAnnounce { shares: Vec<ShareAnnounce> },
    /// Announce an upcoming transfer for one path.
    TransferOffer {
        task_id: Uuid,
        profile_id: Uuid,
        path: String,
        kind: TaskKind,
        size: u64,
        mtime_ms: i64,
        hash: Option<[u8; 32]>,
    },
    /// Receiver is ready; sender starts at `resume_chunk`.
    TransferAccept { task_id: Uuid, resume_chunk: u64 },
    /// Receiver will not take this transfer (e.g. receive not allowed).
    TransferRefuse { task_id: Uuid, reason: String },
    /// One content chunk. `seq` is strictly increasing per task.
    TransferChunk {
        task_id: Uuid,
        seq: u64,
        data: Vec<u8>,
    },
    /// Receiver acknowledges having durably buffered chunk `seq`.
    TransferAck { task_id: Uuid, seq: u64 },
    /// Receiver verified integrity and moved the file into place.
    TransferDone { task_id: Uuid },
    /// Receiver-side failure; the sender drops the task.
    TransferFailed { task_id: Uuid, reason: String },
    /// A path was deleted locally; receiver applies it only if its own
    /// delete permission allows.
    DeleteNotice {
        profile_id: Uuid,
        path: String,
        is_dir: bool,
    },
    KeepAlive,
}

impl WireMessage {
    /// Short tag for logging without dumping chunk payloads.
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "hello",
            WireMessage::Challenge { .. } => "challenge",
            WireMessage::Proof { .. } => "proof",
            WireMessage::PairingDecision { .. } => "pairing-decision",
            WireMessage::ProfileAnnounce { .. } => "profile-announce",
            WireMessage::TransferOffer { .. } => "transfer-offer",
            WireMessage::TransferAccept { .. } => "transfer-accept",
            WireMessage::TransferRefuse { .. } => "transfer-refuse",
            WireMessage::TransferChunk { .. } => "transfer-chunk",
            WireMessage::TransferAck { .. } => "transfer-ack",
            WireMessage::TransferDone { .. } => "transfer-done",
            WireMessage::TransferFailed { .. } => "transfer-failed",
            WireMessage::DeleteNotice { .. } => "delete-notice",
            WireMessage::KeepAlive => "keep-alive",
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(anyhow!("outgoing frame exceeds limit: {} bytes", body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<WireMessage>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("incoming frame exceeds limit: {} bytes", len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let message = serde_json::from_slice(&body)
        .map_err(|e| anyhow!("malformed wire message: {}", e))?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn round_trip(message: WireMessage) -> WireMessage {
        let (mut a, mut b) = duplex(MAX_FRAME_LEN + 16);
        write_frame(&mut a, &message).await.unwrap();
        read_frame(&mut b).await.unwrap()
    }

    #[tokio::test]
    async fn test_hello_round_trip() {
        let sent = WireMessage::Hello {
            device_id: "ab".repeat(32),
            display_name: "desk".into(),
            public_key: vec![1u8; 32],
        };
        match round_trip(sent).await {
            WireMessage::Hello {
                device_id,
                display_name,
                public_key,
            } => {
                assert_eq!(device_id, "ab".repeat(32));
                assert_eq!(display_name, "desk");
                assert_eq!(public_key, vec![1u8; 32]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chunk_round_trip_preserves_payload() {
        let task_id = Uuid::new_v4();
        let data: Vec<u8> = (0..CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        let sent = WireMessage::TransferChunk {
            task_id,
            seq: 17,
            data: data.clone(),
        };
        match round_trip(sent).await {
            WireMessage::TransferChunk {
                task_id: got_id,
                seq,
                data: got,
            } => {
                assert_eq!(got_id, task_id);
                assert_eq!(seq, 17);
                assert_eq!(got, data);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sequential_frames_stay_ordered() {
        let (mut a, mut b) = duplex(1 << 20);
        write_frame(&mut a, &WireMessage::KeepAlive).await.unwrap();
        write_frame(
            &mut a,
            &WireMessage::Challenge { nonce: [9u8; 32] },
        )
        .await
        .unwrap();

        assert!(matches!(
            read_frame(&mut b).await.unwrap(),
            WireMessage::KeepAlive
        ));
        assert!(matches!(
            read_frame(&mut b).await.unwrap(),
            WireMessage::Challenge { nonce } if nonce == [9u8; 32]
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = duplex(64);
        // Hand-craft a frame header claiming an absurd length
        tokio::io::AsyncWriteExt::write_u32(&mut a, (MAX_FRAME_LEN as u32) + 1)
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_garbage_body_is_rejected() {
        let (mut a, mut b) = duplex(64);
        tokio::io::AsyncWriteExt::write_u32(&mut a, 4).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, b"\xff\xfe\x00\x01")
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("malformed wire message"));
    }
}
