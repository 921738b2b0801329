//! Argon2id passphrase derivation

use crate::config::EncryptionConfig;
use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

/// Key material produced by [`derive_key`], together with the salt used
pub struct DerivedKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
    salt: [u8; SALT_SIZE],
}

impl DerivedKey {
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }
}

/// Derive a 256-bit key from a passphrase with Argon2id.
///
/// A fresh random salt is generated when `salt` is `None`.
pub fn derive_key(
    password: &[u8],
    salt: Option<&[u8]>,
    config: &EncryptionConfig,
) -> Result<DerivedKey> {
    let mut salt_bytes = [0u8; SALT_SIZE];
    match salt {
        Some(s) if s.len() == SALT_SIZE => salt_bytes.copy_from_slice(s),
        Some(s) => {
            return Err(Error::InvalidKeyLength {
                expected: SALT_SIZE,
                got: s.len(),
            })
        }
        None => rand::thread_rng().fill_bytes(&mut salt_bytes),
    }

    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon
        .hash_password_into(password, &salt_bytes, key.as_mut())
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;

    Ok(DerivedKey {
        key,
        salt: salt_bytes,
    })
}
