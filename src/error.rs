//! Error types for vfsync

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vfsync
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Sector {sector} failed authentication")]
    SectorAuthentication { sector: u64 },

    // Recovery structures
    #[error("Corrupt index file: {0}")]
    CorruptIndex(String),

    // Open file errors
    #[error("Open file not found: {0}")]
    NotFound(i64),

    #[error("File {0} was deleted")]
    Deleted(i64),

    #[error("Handle for file {0} has already been released")]
    StaleHandle(i64),

    #[error("File {0} is read-only")]
    ReadOnly(i64),

    #[error("Extending file {file_id} to {target} bytes failed: {reason}")]
    ExtendFailed {
        file_id: i64,
        target: u64,
        reason: String,
    },

    #[error("Extending file {0} was interrupted")]
    ExtendKilled(i64),

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Invalid range: offset {offset}, length {length}")]
    InvalidRange { offset: u64, length: u64 },

    // Device errors
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to libc errno for the filesystem layer
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) | Error::Deleted(_) | Error::DeviceNotFound(_) => libc::ENOENT,
            Error::StaleHandle(_) => libc::EBADF,
            Error::ReadOnly(_) => libc::EACCES,
            Error::FileTooLarge { .. } => libc::EFBIG,
            Error::InvalidRange { .. } => libc::EINVAL,
            Error::ExtendKilled(_) => libc::EINTR,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            e if e.is_crypto() => crypto_err_to_errno(e),
            _ => libc::EIO,
        }
    }

    /// Whether this error came out of the sector codec or key handling
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Error::Encryption(_)
                | Error::Decryption(_)
                | Error::KeyDerivation(_)
                | Error::InvalidKeyLength { .. }
                | Error::SectorAuthentication { .. }
        )
    }
}

/// Map a cryptographic failure to the errno handed back to the OS.
///
/// Bad key material is an invalid argument; everything else looks like
/// unreadable storage.
pub fn crypto_err_to_errno(err: &Error) -> libc::c_int {
    match err {
        Error::InvalidKeyLength { .. } | Error::KeyDerivation(_) => libc::EINVAL,
        _ => libc::EIO,
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
