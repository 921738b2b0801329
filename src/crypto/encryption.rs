//! AES-256-GCM Encryption Implementation
//!
//! All sector data is encrypted using AES-256-GCM which provides:
//! - Confidentiality: Data is encrypted
//! - Integrity: Any tampering is detected
//! - Authentication: AAD binds a sector to its position in the file

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

/// Encrypted data container with nonce and authentication tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// Nonce used for encryption (unique per encryption)
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with appended authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Get the total size of encrypted data
    pub fn size(&self) -> usize {
        NONCE_SIZE + self.ciphertext.len()
    }

    /// Serialize to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Decryption("Data too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);

        Ok(EncryptedData {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }
}

/// Build a reusable AES-256-GCM key
pub(crate) fn aead_key(key: &[u8; KEY_SIZE]) -> Result<LessSafeKey> {
    let unbound_key = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Encryption("Failed to create encryption key".to_string()))?;
    Ok(LessSafeKey::new(unbound_key))
}

/// Encrypt with an already constructed key and a fresh random nonce
pub(crate) fn seal(key: &LessSafeKey, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedData> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
    in_out.extend_from_slice(plaintext);

    key.seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| Error::Encryption("Encryption failed".to_string()))?;

    Ok(EncryptedData {
        nonce: nonce_bytes,
        ciphertext: in_out,
    })
}

/// Decrypt with an already constructed key
pub(crate) fn open(key: &LessSafeKey, encrypted: &EncryptedData, aad: &[u8]) -> Result<Vec<u8>> {
    if encrypted.ciphertext.len() < TAG_SIZE {
        return Err(Error::Decryption("Ciphertext too short".to_string()));
    }

    let nonce = Nonce::assume_unique_for_key(encrypted.nonce);

    let mut in_out = encrypted.ciphertext.clone();
    let plaintext = key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| {
            Error::Decryption("Decryption failed - data corrupted or wrong key".to_string())
        })?;

    Ok(plaintext.to_vec())
}
