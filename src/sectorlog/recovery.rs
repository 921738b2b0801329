//! Crash recovery for the sector log

use super::{header_valid, EncryptedDataFile, LogRecord, CHAIN_TAG_SIZE, LOG_HEADER_SIZE, LOG_RECORD_SIZE, RECORD_PREFIX_SIZE};
use crate::config::SECTOR_SIZE;
use crate::crypto::{KEY_SIZE, PHYSICAL_SECTOR_SIZE};
use crate::error::Result;
use std::fs::File;
use std::io::Read;
use tracing::{info, warn};

/// Why a scan stopped before the end of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Missing or unrecognized header
    BadHeader,
    /// Trailing bytes shorter than one record
    TornRecord,
    /// Chain tag did not verify
    TagMismatch,
    /// Record fields are not a sector-aligned single-sector write
    InvalidRecord,
}

/// Result of validating a log image
#[derive(Debug, Default)]
pub struct LogScan {
    /// Records that verified, in log order
    pub records: Vec<LogRecord>,
    /// Set when the scan did not reach the end of the log
    pub stopped: Option<StopReason>,
    /// Bytes after the last verified record
    pub discarded_bytes: u64,
}

/// Outcome of replaying a log into its data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Records applied to the data file
    pub applied: usize,
    /// Bytes of the log that were not applied
    pub discarded_bytes: u64,
    /// Logical size recorded after recovery
    pub size: u64,
    pub stopped: Option<StopReason>,
}

/// Validate a log image and return the longest verifiable prefix
pub fn scan_log(bytes: &[u8], key: &[u8; KEY_SIZE]) -> LogScan {
    let header_len = LOG_HEADER_SIZE as usize;
    if !header_valid(bytes) {
        return LogScan {
            records: Vec::new(),
            stopped: Some(StopReason::BadHeader),
            discarded_bytes: bytes.len() as u64,
        };
    }

    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(&bytes[..header_len]);

    let mut scan = LogScan::default();
    let record_len = LOG_RECORD_SIZE as usize;
    let mut pos = header_len;

    while pos < bytes.len() {
        if bytes.len() - pos < record_len {
            scan.stopped = Some(StopReason::TornRecord);
            break;
        }
        let raw = &bytes[pos..pos + record_len];
        let body = &raw[..RECORD_PREFIX_SIZE + PHYSICAL_SECTOR_SIZE];
        let tag = &raw[RECORD_PREFIX_SIZE + PHYSICAL_SECTOR_SIZE..];
        debug_assert_eq!(tag.len(), CHAIN_TAG_SIZE);

        let mut next = hasher.clone();
        next.update(body);
        // blake3::Hash compares in constant time
        if next.finalize() != blake3::Hash::from(read_tag(tag)) {
            scan.stopped = Some(StopReason::TagMismatch);
            break;
        }

        let offset = read_u64(&raw[..8]);
        let length = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let file_size = read_u64(&raw[12..20]);
        if offset % SECTOR_SIZE != 0 || length as u64 != SECTOR_SIZE {
            scan.stopped = Some(StopReason::InvalidRecord);
            break;
        }

        hasher = next;
        scan.records.push(LogRecord {
            offset,
            length,
            file_size,
            physical: raw[RECORD_PREFIX_SIZE..RECORD_PREFIX_SIZE + PHYSICAL_SECTOR_SIZE].to_vec(),
        });
        pos += record_len;
    }

    scan.discarded_bytes = (bytes.len() - pos) as u64;
    scan
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_tag(bytes: &[u8]) -> [u8; CHAIN_TAG_SIZE] {
    let mut tag = [0u8; CHAIN_TAG_SIZE];
    tag.copy_from_slice(bytes);
    tag
}

/// Replay a leftover log into `data` and empty it
///
/// Records are applied in order up to the first one that is torn or fails
/// verification. The recorded size becomes the larger of the header size
/// and the sizes carried by applied records.
pub fn recover(mut log: &File, data: &EncryptedDataFile, key: &[u8; KEY_SIZE]) -> Result<RecoveryReport> {
    let mut bytes = Vec::new();
    log.read_to_end(&mut bytes)?;
    if bytes.is_empty() {
        return Ok(RecoveryReport {
            size: data.read_size()?,
            ..Default::default()
        });
    }

    let scan = scan_log(&bytes, key);
    let mut size = data.read_size()?;
    for record in &scan.records {
        data.write_physical(record.sector(), &record.physical)?;
        size = size.max(record.file_size);
    }
    data.write_size(size)?;
    data.sync()?;

    log.set_len(0)?;
    log.sync_data()?;

    if let Some(reason) = scan.stopped {
        warn!(
            ?reason,
            applied = scan.records.len(),
            discarded_bytes = scan.discarded_bytes,
            "Sector log replay stopped early"
        );
    } else if !scan.records.is_empty() {
        info!(applied = scan.records.len(), size, "Sector log replayed");
    }

    Ok(RecoveryReport {
        applied: scan.records.len(),
        discarded_bytes: scan.discarded_bytes,
        size,
        stopped: scan.stopped,
    })
}
