//! Sector write log for encrypted files
//!
//! Encrypted writes are not applied to the data file directly. Each
//! re-encrypted sector is appended to a per-file log together with its
//! position and the logical file size after the write, and a running keyed
//! BLAKE3 hash over everything appended so far is stored after the record.
//! Pending sectors are served from the log until a checkpoint folds them
//! into the data file.
//!
//! ```text
//! header:  | VFSL | version u16 | reserved u16 | log id u64 |
//! record:  | offset u64 | length u32 | file size u64 | sector | chain tag [32] |
//! ```
//!
//! After a crash the log is replayed in order up to the first record that
//! is short or whose chain tag does not verify; nothing after that point is
//! ever applied.

mod datafile;
mod recovery;

pub use datafile::{EncryptedDataFile, DATA_HEADER_SIZE};
pub use recovery::{recover, scan_log, LogScan, RecoveryReport, StopReason};

use crate::config::SECTOR_SIZE;
use crate::crypto::{KEY_SIZE, PHYSICAL_SECTOR_SIZE};
use crate::error::Result;
use rand::RngCore;
use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use tracing::debug;

const LOG_MAGIC: [u8; 4] = *b"VFSL";
const LOG_VERSION: u16 = 1;

/// Size of the log header
pub const LOG_HEADER_SIZE: u64 = 16;

/// offset + length + file size
const RECORD_PREFIX_SIZE: usize = 8 + 4 + 8;

/// Size of the chain tag following each record
pub const CHAIN_TAG_SIZE: usize = 32;

/// Total on-disk size of one log record
pub const LOG_RECORD_SIZE: u64 = (RECORD_PREFIX_SIZE + PHYSICAL_SECTOR_SIZE + CHAIN_TAG_SIZE) as u64;

/// One decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Sector-aligned logical offset
    pub offset: u64,
    /// Logical bytes covered, always one sector
    pub length: u32,
    /// Logical file size after this write
    pub file_size: u64,
    /// Encrypted sector as stored in the data file
    pub physical: Vec<u8>,
}

impl LogRecord {
    pub fn sector(&self) -> u64 {
        self.offset / SECTOR_SIZE
    }

    fn prefix(&self) -> [u8; RECORD_PREFIX_SIZE] {
        let mut prefix = [0u8; RECORD_PREFIX_SIZE];
        prefix[..8].copy_from_slice(&self.offset.to_le_bytes());
        prefix[8..12].copy_from_slice(&self.length.to_le_bytes());
        prefix[12..].copy_from_slice(&self.file_size.to_le_bytes());
        prefix
    }
}

pub(crate) fn log_header(log_id: u64) -> [u8; LOG_HEADER_SIZE as usize] {
    let mut header = [0u8; LOG_HEADER_SIZE as usize];
    header[..4].copy_from_slice(&LOG_MAGIC);
    header[4..6].copy_from_slice(&LOG_VERSION.to_le_bytes());
    header[8..].copy_from_slice(&log_id.to_le_bytes());
    header
}

pub(crate) fn header_valid(header: &[u8]) -> bool {
    header.len() >= LOG_HEADER_SIZE as usize
        && header[..4] == LOG_MAGIC
        && u16::from_le_bytes([header[4], header[5]]) == LOG_VERSION
}

/// Append-only log of provisional sector writes for one open file
pub struct SectorLog {
    file: File,
    key: [u8; KEY_SIZE],
    /// Running hash over the header and every record appended since
    hasher: blake3::Hasher,
    /// Append position
    log_offset: u64,
    /// sector index -> position of its newest record
    pending: BTreeMap<u64, u64>,
    /// Records appended since the last reset, superseded ones included
    entries: u64,
}

impl SectorLog {
    /// Start a fresh, empty log in `file`
    pub fn create(file: File, key: [u8; KEY_SIZE]) -> Result<Self> {
        let mut log = SectorLog {
            file,
            key,
            hasher: blake3::Hasher::new_keyed(&key),
            log_offset: 0,
            pending: BTreeMap::new(),
            entries: 0,
        };
        log.reset()?;
        Ok(log)
    }

    /// Drop every record and begin a new hash chain
    fn reset(&mut self) -> Result<()> {
        let header = log_header(rand::thread_rng().next_u64());
        self.file.set_len(0)?;
        self.file.write_all_at(&header, 0)?;

        self.hasher = blake3::Hasher::new_keyed(&self.key);
        self.hasher.update(&header);
        self.log_offset = LOG_HEADER_SIZE;
        self.pending.clear();
        self.entries = 0;
        Ok(())
    }

    /// Append one encrypted sector
    pub fn append(&mut self, sector: u64, physical: &[u8], file_size: u64) -> Result<()> {
        let record = LogRecord {
            offset: sector * SECTOR_SIZE,
            length: SECTOR_SIZE as u32,
            file_size,
            physical: physical.to_vec(),
        };

        let prefix = record.prefix();
        self.hasher.update(&prefix);
        self.hasher.update(&record.physical);
        let tag = self.hasher.finalize();

        let mut bytes = Vec::with_capacity(LOG_RECORD_SIZE as usize);
        bytes.extend_from_slice(&prefix);
        bytes.extend_from_slice(&record.physical);
        bytes.extend_from_slice(tag.as_bytes());
        self.file.write_all_at(&bytes, self.log_offset)?;

        if let Some(previous) = self.pending.insert(sector, self.log_offset) {
            debug!(sector, previous, "Superseded log entry");
        }
        self.log_offset += LOG_RECORD_SIZE;
        self.entries += 1;
        Ok(())
    }

    /// Newest logged version of `sector`, if it has not been folded yet
    pub fn read_physical(&self, sector: u64) -> Result<Option<Vec<u8>>> {
        let Some(&position) = self.pending.get(&sector) else {
            return Ok(None);
        };
        let mut buf = vec![0u8; PHYSICAL_SECTOR_SIZE];
        self.file
            .read_exact_at(&mut buf, position + RECORD_PREFIX_SIZE as u64)?;
        Ok(Some(buf))
    }

    pub fn contains(&self, sector: u64) -> bool {
        self.pending.contains_key(&sector)
    }

    /// Distinct sectors waiting to be folded
    pub fn pending_sectors(&self) -> usize {
        self.pending.len()
    }

    /// Records appended since the last checkpoint
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Make appended records durable
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Fold every pending sector into `data`, record `size` as the logical
    /// size, and start a new empty log. Returns the number of sectors written.
    pub fn checkpoint(&mut self, data: &EncryptedDataFile, size: u64) -> Result<usize> {
        let folded = self.pending.len();
        for (&sector, &position) in &self.pending {
            let mut buf = vec![0u8; PHYSICAL_SECTOR_SIZE];
            self.file
                .read_exact_at(&mut buf, position + RECORD_PREFIX_SIZE as u64)?;
            data.write_physical(sector, &buf)?;
        }
        data.write_size(size)?;
        data.sync()?;

        self.reset()?;
        debug!(folded, size, "Sector log folded into data file");
        Ok(folded)
    }
}
