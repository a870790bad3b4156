//! # Pairing Handshake
//!
//! Mutual authentication run on every new connection, in both
//! directions: exchange identities, challenge the peer with a random
//! nonce, and verify the signed proof against the presented public key.
//!
//! Trust is decided against the registry: a known device must present
//! exactly the key pinned at pairing time; a valid signature under a
//! different key is treated as impersonation and kills the connection.
//! An unknown device that proves key possession comes out authenticated
//! but untrusted; data flows only after the user confirms the pairing.
//!
//! The exchange is generic over the stream halves, so it runs unchanged
//! over QUIC in production and duplex pipes in tests.

use ed25519_dalek::{Signature, VerifyingKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::identity::{self, DeviceIdentity};
use crate::registry::ProfileRegistry;
use crate::wire::{read_frame, write_frame, WireMessage};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a completed mutual authentication.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub device_id: String,
    pub display_name: String,
    pub public_key: VerifyingKey,
    /// Known pairing whose pinned key matched. Untrusted outcomes need
    /// user confirmation before any data transfer.
    pub trusted: bool,
}

/// Run the handshake with an overall deadline.
pub async fn authenticate<R, W>(
    reader: &mut R,
    writer: &mut W,
    identity: &DeviceIdentity,
    registry: &ProfileRegistry,
    initiator: bool,
) -> Result<HandshakeOutcome, SyncError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        exchange(reader, writer, identity, registry, initiator),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(SyncError::HandshakeTimeout),
    }
}

async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    identity: &DeviceIdentity,
    registry: &ProfileRegistry,
    initiator: bool,
) -> Result<HandshakeOutcome, SyncError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let own_hello = WireMessage::Hello {
        device_id: identity.device_id(),
        display_name: identity.display_name().to_string(),
        public_key: identity.public_key_bytes().to_vec(),
    };

    // Identity exchange. The dialer speaks first so the acceptor's read
    // of the fresh stream has something to wake on.
    let peer_hello = if initiator {
        send(writer, &own_hello).await?;
        recv(reader).await?
    } else {
        let hello = recv(reader).await?;
        send(writer, &own_hello).await?;
        hello
    };

    let (peer_id, peer_name, peer_key) = match peer_hello {
        WireMessage::Hello {
            device_id,
            display_name,
            public_key,
        } => {
            let key = identity::parse_public_key(&public_key)
                .map_err(|e| SyncError::HandshakeProtocol(e.to_string()))?;
            (device_id, display_name, key)
        }
        other => {
            return Err(SyncError::HandshakeProtocol(format!(
                "expected hello, got {}",
                other.kind_name()
            )))
        }
    };

    // The claimed identifier must be derivable from the presented key
    let derived_id = identity::device_id_for(&peer_key.to_bytes());
    if derived_id != peer_id {
        return Err(SyncError::Authentication {
            device_id: peer_id,
            reason: "device id does not match presented public key".into(),
        });
    }
    if peer_id == identity.device_id() {
        return Err(SyncError::HandshakeProtocol(
            "connected to ourselves".into(),
        ));
    }

    // Challenge round: prove possession of the matching private key
    let own_nonce = identity::random_nonce();
    send(writer, &WireMessage::Challenge { nonce: own_nonce }).await?;
    let peer_nonce = match recv(reader).await? {
        WireMessage::Challenge { nonce } => nonce,
        other => {
            return Err(SyncError::HandshakeProtocol(format!(
                "expected challenge, got {}",
                other.kind_name()
            )))
        }
    };

    let proof = identity.sign_challenge(&peer_nonce);
    send(
        writer,
        &WireMessage::Proof {
            signature: proof.to_bytes().to_vec(),
        },
    )
    .await?;
    let peer_signature = match recv(reader).await? {
        WireMessage::Proof { signature } => parse_signature(&signature)?,
        other => {
            return Err(SyncError::HandshakeProtocol(format!(
                "expected proof, got {}",
                other.kind_name()
            )))
        }
    };

    if !identity::verify_challenge(&peer_key, &own_nonce, &peer_signature) {
        return Err(SyncError::Authentication {
            device_id: peer_id,
            reason: "challenge signature invalid".into(),
        });
    }

    // Trust decision against the pinned pairing key
    let trusted = match registry.paired_device(&peer_id) {
        Some(paired) => {
            if paired.public_key != peer_key.to_bytes() {
                warn!(
                    "Device {} presented a key different from the pinned pairing key",
                    peer_id
                );
                return Err(SyncError::Authentication {
                    device_id: peer_id,
                    reason: "public key differs from pinned pairing key".into(),
                });
            }
            true
        }
        None => false,
    };

    debug!(
        "Handshake with {} ({}) complete, trusted={}",
        peer_id, peer_name, trusted
    );
    Ok(HandshakeOutcome {
        device_id: peer_id,
        display_name: peer_name,
        public_key: peer_key,
        trusted,
    })
}

fn parse_signature(bytes: &[u8]) -> Result<Signature, SyncError> {
    let array: [u8; 64] = bytes
        .try_into()
        .map_err(|_| SyncError::HandshakeProtocol("signature must be 64 bytes".into()))?;
    Ok(Signature::from_bytes(&array))
}

async fn send<W>(writer: &mut W, message: &WireMessage) -> Result<(), SyncError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, message)
        .await
        .map_err(|e| SyncError::HandshakeProtocol(e.to_string()))
}

async fn recv<R>(reader: &mut R) -> Result<WireMessage, SyncError>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader)
        .await
        .map_err(|e| SyncError::HandshakeProtocol(e.to_string()))
}
