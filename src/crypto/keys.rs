//! Key Management for vfsync
//!
//! Implements a two-level key structure:
//! - Master Key: Derived from the user's crypto passphrase
//! - File Keys: Per-file keys derived from master key + a stable key id
//!
//! A file key is split again into a sector encryption key and a separate
//! key for authenticating the sector write log.

use crate::config::EncryptionConfig;
use crate::crypto::{derive_key, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::hkdf::{self, Salt, HKDF_SHA256};
use zeroize::Zeroizing;

/// Master key derived from user password
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
    salt: [u8; SALT_SIZE],
}

impl MasterKey {
    /// Create a new master key from a password
    pub fn from_password(password: &[u8], config: &EncryptionConfig) -> Result<Self> {
        let salt = if config.salt.is_empty() {
            None
        } else {
            Some(config.salt.as_slice())
        };

        let derived = derive_key(password, salt, config)?;

        Ok(MasterKey {
            key: Zeroizing::new(*derived.key()),
            salt: *derived.salt(),
        })
    }

    /// Wrap raw key material obtained elsewhere
    pub fn from_bytes(key: &[u8], salt: [u8; SALT_SIZE]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: key.len(),
            });
        }
        let mut material = Zeroizing::new([0u8; KEY_SIZE]);
        material.copy_from_slice(key);
        Ok(MasterKey {
            key: material,
            salt,
        })
    }

    /// Get the salt
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    /// Derive a subkey for a specific purpose
    pub fn derive_subkey(&self, purpose: &[u8]) -> Result<[u8; KEY_SIZE]> {
        hkdf_expand(&self.salt, self.key.as_ref(), purpose)
    }

    /// Derive the key of one encrypted file
    pub fn file_key(&self, key_id: &str) -> Result<FileKey> {
        let purpose = format!("vfsync-file-v1:{}", key_id);
        let key = self.derive_subkey(purpose.as_bytes())?;
        Ok(FileKey {
            key: Zeroizing::new(key),
        })
    }
}

/// Per-file encryption key
#[derive(Clone)]
pub struct FileKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl FileKey {
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        FileKey {
            key: Zeroizing::new(key),
        }
    }

    /// Fresh random key, used for newly created files
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        FileKey::from_bytes(key)
    }

    /// Key used to encrypt sectors
    pub fn sector_key(&self) -> Result<[u8; KEY_SIZE]> {
        hkdf_expand(&[0u8; SALT_SIZE], self.key.as_ref(), b"vfsync-sector-v1")
    }

    /// Key used for the running authentication hash of the sector log
    pub fn log_key(&self) -> Result<[u8; KEY_SIZE]> {
        hkdf_expand(&[0u8; SALT_SIZE], self.key.as_ref(), b"vfsync-sector-log-v1")
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileKey(..)")
    }
}

fn hkdf_expand(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let salt = Salt::new(HKDF_SHA256, salt);
    let prk = salt.extract(ikm);

    let info = [info];
    let mut output = [0u8; KEY_SIZE];
    prk.expand(&info, HkdfKeyType)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
        .fill(&mut output)
        .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;

    Ok(output)
}

/// HKDF key type for ring
struct HkdfKeyType;

impl hkdf::KeyType for HkdfKeyType {
    fn len(&self) -> usize {
        KEY_SIZE
    }
}
