//! Cryptography module for vfsync
//!
//! Provides AES-256-GCM sector encryption with per-file keys derived
//! through HKDF, and Argon2id for turning a passphrase into the master key.
//! File contents are encrypted sector by sector so any single sector can be
//! rewritten without touching its neighbours.

mod encryption;
mod kdf;
mod keys;
mod sector;

pub use encryption::EncryptedData;
pub use kdf::{derive_key, DerivedKey};
pub use keys::{FileKey, MasterKey};
pub use sector::{sector_of, sectors_for, SectorCodec, PHYSICAL_SECTOR_SIZE};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;
