//! # Device Identity
//!
//! This module owns the persistent cryptographic identity of this device:
//! - Ed25519 key pair generation and storage (RFC 8032)
//! - Stable device identifier derived from the public key
//! - Challenge signing and verification for the pairing handshake
//!
//! The identity is created once and persisted; it is never silently
//! regenerated. If the key file cannot be written the identity stays
//! usable in memory for the current run, which is surfaced as a warning
//! because pairings made with it will not survive a restart.

use anyhow::Result;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Domain separator so handshake proofs cannot be replayed in another
/// signing context.
const CHALLENGE_CONTEXT: &[u8] = b"peersync-handshake-v1";

/// Cryptographic identity of this device.
///
/// The Ed25519 key pair is the root of trust: the public key is exchanged
/// and pinned at pairing time, and the device id is derived from it.
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    display_name: String,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: [u8; 32],
    display_name: String,
}

/// Derive the stable device identifier for a public key.
///
/// Hex of `blake3(public_key)`. Identifiers are re-derived from presented
/// keys during the handshake, never trusted as claimed.
pub fn device_id_for(public_key: &[u8; 32]) -> String {
    let digest: [u8; 32] = blake3::hash(public_key).into();
    hex::encode(digest)
}

impl DeviceIdentity {
    pub fn generate(display_name: String) -> Self {
        let mut csprng = OsRng {};
        let signing_key = SigningKey::generate(&mut csprng);
        Self {
            signing_key,
            display_name,
        }
    }

    /// Load the persisted identity, generating and persisting a fresh one
    /// if none exists yet.
    ///
    /// A failure to write the new key file is reported but not fatal: the
    /// in-memory identity works for this run only.
    pub fn load_or_create(path: &Path, default_name: &str) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let identity = Self::generate(default_name.to_string());
        if let Err(e) = identity.save(path) {
            warn!(
                "Failed to persist identity to {}: {}. Operating with an \
                 in-memory identity; pairings will not survive a restart.",
                path.display(),
                e
            );
        }
        Ok(identity)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: IdentityFile = toml::from_str(&content)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&file.secret_key),
            display_name: file.display_name,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = IdentityFile {
            secret_key: self.signing_key.to_bytes(),
            display_name: self.display_name.clone(),
        };
        std::fs::write(path, toml::to_string_pretty(&file)?)?;

        // Key material must not be world-readable
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn device_id(&self) -> String {
        device_id_for(&self.public_key_bytes())
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn set_display_name(&mut self, name: String) {
        self.display_name = name;
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a handshake challenge nonce.
    pub fn sign_challenge(&self, nonce: &[u8; 32]) -> Signature {
        let mut message = Vec::with_capacity(CHALLENGE_CONTEXT.len() + nonce.len());
        message.extend_from_slice(CHALLENGE_CONTEXT);
        message.extend_from_slice(nonce);
        self.signing_key.sign(&message)
    }
}

/// Verify a handshake challenge signature against a peer's public key.
pub fn verify_challenge(public_key: &VerifyingKey, nonce: &[u8; 32], signature: &Signature) -> bool {
    let mut message = Vec::with_capacity(CHALLENGE_CONTEXT.len() + nonce.len());
    message.extend_from_slice(CHALLENGE_CONTEXT);
    message.extend_from_slice(nonce);
    public_key.verify(&message, signature).is_ok()
}

/// Parse a 32-byte Ed25519 public key from raw bytes.
pub fn parse_public_key(bytes: &[u8]) -> Result<VerifyingKey> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes, got {}", bytes.len()))?;
    VerifyingKey::from_bytes(&array).map_err(|_| anyhow::anyhow!("malformed Ed25519 public key"))
}

/// Generate a random 32-byte handshake nonce.
pub fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::RngCore::fill_bytes(&mut OsRng {}, &mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_generation() {
        let identity = DeviceIdentity::generate("desk".into());
        // blake3 output is 32 bytes = 64 hex chars
        assert_eq!(identity.device_id().len(), 64);
        assert_eq!(identity.display_name(), "desk");
    }

    #[test]
    fn test_device_id_is_derived_from_public_key() {
        let identity = DeviceIdentity::generate("desk".into());
        assert_eq!(
            identity.device_id(),
            device_id_for(&identity.public_key_bytes())
        );

        let other = DeviceIdentity::generate("desk".into());
        assert_ne!(identity.device_id(), other.device_id());
    }

    #[test]
    fn test_identity_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("identity.toml");

        let original = DeviceIdentity::generate("laptop".into());
        original.save(&key_path).unwrap();

        let loaded = DeviceIdentity::load(&key_path).unwrap();
        assert_eq!(original.device_id(), loaded.device_id());
        assert_eq!(loaded.display_name(), "laptop");
    }

    #[test]
    fn test_load_or_create_existing() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("identity.toml");

        let original = DeviceIdentity::generate("first".into());
        original.save(&key_path).unwrap();

        // Must load the existing identity, not generate a new one
        let loaded = DeviceIdentity::load_or_create(&key_path, "ignored").unwrap();
        assert_eq!(original.device_id(), loaded.device_id());
        assert_eq!(loaded.display_name(), "first");
    }

    #[test]
    fn test_load_or_create_new() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("identity.toml");

        let identity = DeviceIdentity::load_or_create(&key_path, "fresh").unwrap();
        assert!(key_path.exists());

        let loaded = DeviceIdentity::load(&key_path).unwrap();
        assert_eq!(identity.device_id(), loaded.device_id());
    }

    #[test]
    fn test_challenge_sign_and_verify() {
        let identity = DeviceIdentity::generate("desk".into());
        let nonce = random_nonce();

        let signature = identity.sign_challenge(&nonce);
        assert!(verify_challenge(&identity.public_key(), &nonce, &signature));

        // Different nonce must not verify
        let other_nonce = random_nonce();
        assert!(!verify_challenge(
            &identity.public_key(),
            &other_nonce,
            &signature
        ));

        // Different key must not verify
        let other = DeviceIdentity::generate("desk".into());
        assert!(!verify_challenge(&other.public_key(), &nonce, &signature));
    }

    #[test]
    fn test_parse_public_key_rejects_bad_length() {
        assert!(parse_public_key(&[0u8; 31]).is_err());
        let identity = DeviceIdentity::generate("desk".into());
        assert!(parse_public_key(&identity.public_key_bytes()).is_ok());
    }
}
