//! Cryptographic primitives for keychain containers.
//!
//! Blob payloads use ChaCha20-Poly1305 with a 32-byte master key derived from
//! the owner's passphrase via HKDF-SHA256 over a per-container salt. The
//! encrypted bytes and nonce are exported as base64 strings inside the blob
//! envelope. Master keys live in memory only while a container is unlocked
//! and are wiped on drop.

use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const BLOB_NONCE_SIZE: usize = 12;
/// Master key size for ChaCha20-Poly1305 (256 bits).
pub const MASTER_KEY_SIZE: usize = 32;
/// Per-container salt size for key derivation.
pub const SALT_SIZE: usize = 16;
/// Size of the key check value stored beside a sealed blob.
pub const CHECK_VALUE_SIZE: usize = 8;
/// Size of a container lineage signature.
pub const SIGNATURE_SIZE: usize = 20;

const MASTER_KEY_INFO: &[u8] = b"keywarden master key v1";

/// Errors returned by blob crypto helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },
    #[error("base64 decode failed: {0}")]
    Base64Decode(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Result type alias using CryptoError.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Identifies a container lineage: assigned at container creation and
/// carried through every re-encode of the blob.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlobSignature(pub [u8; SIGNATURE_SIZE]);

impl BlobSignature {
    /// Generate a fresh random signature.
    pub fn random() -> Self {
        let mut bytes = [0u8; SIGNATURE_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        BlobSignature(bytes)
    }
}

/// The secrets of one unlocked container.
///
/// Wiped from memory on drop and on every transition back to the locked
/// state.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecrets {
    key: [u8; MASTER_KEY_SIZE],
}

impl MasterSecrets {
    /// Derive secrets from a passphrase and the container's salt.
    pub fn derive(passphrase: &[u8], salt: &[u8; SALT_SIZE]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
        let mut key = [0u8; MASTER_KEY_SIZE];
        hk.expand(MASTER_KEY_INFO, &mut key)
            .expect("HKDF output length is valid");
        Self { key }
    }

    /// Generate fresh random secrets (new containers, no passphrase yet).
    pub fn random() -> Self {
        let mut key = [0u8; MASTER_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Key check value: lets a passphrase be validated against a sealed blob
    /// without attempting a full decrypt.
    pub fn check_value(&self) -> [u8; CHECK_VALUE_SIZE] {
        let digest = Sha256::digest(self.key);
        let mut check = [0u8; CHECK_VALUE_SIZE];
        check.copy_from_slice(&digest[..CHECK_VALUE_SIZE]);
        check
    }

    /// Raw key bytes, for wrap/unwrap operations.
    pub fn key(&self) -> &[u8; MASTER_KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for MasterSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("MasterSecrets").finish_non_exhaustive()
    }
}

/// Base64-encoded sealed payload (ciphertext + nonce).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// Base64-encoded ciphertext bytes.
    pub ciphertext_b64: String,
    /// Base64-encoded nonce bytes.
    pub nonce_b64: String,
}

/// Generate a random derivation salt.
pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Seal a plaintext under the given secrets with a fresh random nonce.
pub fn seal(secrets: &MasterSecrets, plaintext: &[u8]) -> CryptoResult<SealedPayload> {
    let mut nonce = [0u8; BLOB_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    seal_with_nonce(secrets, &nonce, plaintext)
}

/// Seal a plaintext with a caller-provided nonce.
///
/// This is primarily intended for deterministic tests.
pub fn seal_with_nonce(
    secrets: &MasterSecrets,
    nonce: &[u8; BLOB_NONCE_SIZE],
    plaintext: &[u8],
) -> CryptoResult<SealedPayload> {
    let cipher = ChaCha20Poly1305::new_from_slice(secrets.key())
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let nonce_ref = Nonce::from_slice(nonce);

    let ciphertext = cipher
        .encrypt(nonce_ref, plaintext)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    Ok(SealedPayload {
        ciphertext_b64: BASE64.encode(ciphertext),
        nonce_b64: BASE64.encode(nonce),
    })
}

/// Open a sealed payload. Fails if the key is wrong or the payload was
/// tampered with.
pub fn open(secrets: &MasterSecrets, payload: &SealedPayload) -> CryptoResult<Vec<u8>> {
    let ciphertext = BASE64
        .decode(&payload.ciphertext_b64)
        .map_err(|e| CryptoError::Base64Decode(e.to_string()))?;
    let nonce = BASE64
        .decode(&payload.nonce_b64)
        .map_err(|e| CryptoError::Base64Decode(e.to_string()))?;

    if nonce.len() != BLOB_NONCE_SIZE {
        return Err(CryptoError::InvalidNonceLength {
            expected: BLOB_NONCE_SIZE,
            actual: nonce.len(),
        });
    }

    let cipher = ChaCha20Poly1305::new_from_slice(secrets.key())
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    let nonce_ref = Nonce::from_slice(&nonce);

    cipher
        .decrypt(nonce_ref, ciphertext.as_ref())
        .map_err(|e| CryptoError::Decrypt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let secrets = MasterSecrets::random();
        let payload = seal(&secrets, b"the cargo manifest").unwrap();
        let opened = open(&secrets, &payload).unwrap();
        assert_eq!(opened, b"the cargo manifest");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let secrets = MasterSecrets::random();
        let other = MasterSecrets::random();
        let payload = seal(&secrets, b"secret").unwrap();
        assert!(matches!(
            open(&other, &payload),
            Err(CryptoError::Decrypt(_))
        ));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let salt = random_salt();
        let a = MasterSecrets::derive(b"hunter2", &salt);
        let b = MasterSecrets::derive(b"hunter2", &salt);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.check_value(), b.check_value());
    }

    #[test]
    fn test_derivation_depends_on_salt_and_passphrase() {
        let salt = random_salt();
        let base = MasterSecrets::derive(b"hunter2", &salt);
        assert_ne!(
            base.key(),
            MasterSecrets::derive(b"hunter3", &salt).key()
        );
        assert_ne!(
            base.key(),
            MasterSecrets::derive(b"hunter2", &random_salt()).key()
        );
    }

    #[test]
    fn test_check_value_distinguishes_keys() {
        let a = MasterSecrets::random();
        let b = MasterSecrets::random();
        assert_ne!(a.check_value(), b.check_value());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let secrets = MasterSecrets::random();
        let mut payload = seal(&secrets, b"intact").unwrap();
        let mut raw = BASE64.decode(&payload.ciphertext_b64).unwrap();
        raw[0] ^= 0xff;
        payload.ciphertext_b64 = BASE64.encode(raw);
        assert!(open(&secrets, &payload).is_err());
    }

    #[test]
    fn test_bad_nonce_length_rejected() {
        let secrets = MasterSecrets::random();
        let mut payload = seal(&secrets, b"x").unwrap();
        payload.nonce_b64 = BASE64.encode([0u8; 4]);
        assert_eq!(
            open(&secrets, &payload),
            Err(CryptoError::InvalidNonceLength {
                expected: BLOB_NONCE_SIZE,
                actual: 4
            })
        );
    }

    #[test]
    fn test_signatures_are_unique() {
        assert_ne!(BlobSignature::random(), BlobSignature::random());
    }
}
