//! # warren-crypto: Secret sealing for Warren
//!
//! AES-256-GCM authenticated encryption for cluster secrets, plus the random
//! material behind join tokens. Secrets are sealed by the manager before they
//! enter the replicated store; workers unseal them into tmpfs at container
//! start. Plaintext never touches durable storage on either side.
//!
//! The cluster key is 32 bytes, generated at `cluster init` and distributed
//! to nodes through the join flow (identity issuance is an external
//! collaborator; this crate only loads and uses the key material).

use std::fs;
use std::io::Write;
use std::path::Path;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use thiserror::Error;

/// Length of the cluster key in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Length of a GCM nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors from sealing, unsealing, or key handling.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Decryption failed: wrong key, or ciphertext/nonce tampered with.
    #[error("unseal failed: ciphertext rejected")]
    Unseal,

    /// Encryption failed.
    #[error("seal failed")]
    Seal,

    /// Key material has the wrong length.
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Nonce has the wrong length.
    #[error("invalid nonce length: expected {NONCE_LEN} bytes, got {0}")]
    InvalidNonceLength(usize),

    /// I/O error reading or writing key material.
    #[error("key i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The symmetric cluster key used to seal secrets.
#[derive(Clone)]
pub struct ClusterKey([u8; KEY_LEN]);

impl ClusterKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The raw key bytes, for distribution to joining nodes over mTLS.
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0
    }

    /// Wraps existing key bytes.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Loads the key from a file written by [`ClusterKey::save`].
    pub fn load(path: &Path) -> CryptoResult<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Writes the key to `path` with owner-only permissions.
    pub fn save(&self, path: &Path) -> CryptoResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(&self.0)?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Seals `plaintext`, returning `(ciphertext, nonce)`.
    ///
    /// A fresh random nonce is drawn per call; reuse across calls with the
    /// same key would break GCM, so callers must store the returned nonce
    /// next to the ciphertext rather than invent their own.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
        let cipher = Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::Seal)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Seal)?;
        Ok((ciphertext, nonce.to_vec()))
    }

    /// Unseals `ciphertext` with the stored `nonce`.
    pub fn open(&self, ciphertext: &[u8], nonce: &[u8]) -> CryptoResult<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonceLength(nonce.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::Unseal)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Unseal)
    }
}

impl std::fmt::Debug for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "ClusterKey(..)")
    }
}

/// Generates an opaque join-token secret: 24 random bytes, base64url.
pub fn generate_token_secret() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = ClusterKey::generate();
        let (ciphertext, nonce) = key.seal(b"abc").unwrap();
        assert_ne!(ciphertext, b"abc");
        let plaintext = key.open(&ciphertext, &nonce).unwrap();
        assert_eq!(plaintext, b"abc");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = ClusterKey::generate();
        let (mut ciphertext, nonce) = key.seal(b"payload").unwrap();
        ciphertext[0] ^= 0xff;
        assert!(matches!(
            key.open(&ciphertext, &nonce),
            Err(CryptoError::Unseal)
        ));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let key = ClusterKey::generate();
        let other = ClusterKey::generate();
        let (ciphertext, nonce) = key.seal(b"payload").unwrap();
        assert!(other.open(&ciphertext, &nonce).is_err());
    }

    #[test]
    fn key_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.key");
        let key = ClusterKey::generate();
        key.save(&path).unwrap();

        let loaded = ClusterKey::load(&path).unwrap();
        let (ciphertext, nonce) = key.seal(b"x").unwrap();
        assert_eq!(loaded.open(&ciphertext, &nonce).unwrap(), b"x");
    }

    #[test]
    fn short_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.key");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(
            ClusterKey::load(&path),
            Err(CryptoError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn token_secrets_are_unique_and_printable() {
        let a = generate_token_secret();
        let b = generate_token_secret();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
