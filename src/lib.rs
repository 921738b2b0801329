//! vfsync - open-file runtime for a cloud-synced virtual filesystem
//!
//! This library keeps the per-file state behind every handle the
//! filesystem layer hands out: local cache files, dirty byte ranges waiting
//! for upload, read stream detection, and optional sector-level encryption
//! at rest with a crash-safe write log.

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod interval;
pub mod openfile;
pub mod registry;
pub mod sectorlog;
pub mod stream;

pub use config::Config;
pub use error::{Error, Result};
pub use openfile::FileId;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::FileKey;
    pub use crate::error::{Error, Result};
    pub use crate::openfile::{FileId, OpenFile, OpenFileInfo, UploadPlan};
    pub use crate::registry::{OpenFileRegistry, OpenRequest, UpdateOutcome};
}
