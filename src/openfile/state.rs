//! Mutable state of an open file, guarded by the handle lock

use super::extender::SectorExtender;
use super::FileId;
use crate::crypto::{sector_of, SectorCodec};
use crate::config::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::interval::{IndexFile, IntervalTracker, Segment};
use crate::sectorlog::{EncryptedDataFile, SectorLog};
use crate::stream::{SpeedMeter, StreamCache};
use bytes::Bytes;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

/// Where local data sits relative to the remote copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityState {
    /// Nothing written since open or the last upload
    Clean,
    /// Plain data written, not yet synced
    Dirty,
    /// Encrypted sectors waiting in the log
    PendingLog,
    /// Local writes folded into the data file
    Reconciled,
    Deleted,
}

impl DurabilityState {
    /// Move to `next` unless the handle is already deleted
    pub fn advance(&mut self, next: DurabilityState) -> bool {
        if *self == DurabilityState::Deleted {
            return false;
        }
        *self = next;
        true
    }
}

/// Cache file locations for one file id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub data: PathBuf,
    pub index: PathBuf,
    pub log: PathBuf,
}

impl CachePaths {
    pub fn new(cache_dir: &Path, id: FileId) -> Self {
        let stem = id.cache_stem();
        CachePaths {
            data: cache_dir.join(format!("{}.data", stem)),
            index: cache_dir.join(format!("{}.idx", stem)),
            log: cache_dir.join(format!("{}.log", stem)),
        }
    }

    /// Move every existing cache file to `to`
    pub(crate) fn rename_to(&self, to: &CachePaths) -> Result<()> {
        for (from, to) in [
            (&self.data, &to.data),
            (&self.index, &to.index),
            (&self.log, &to.log),
        ] {
            if from.exists() {
                std::fs::rename(from, to)?;
            }
        }
        Ok(())
    }

    pub(crate) fn remove_all(&self) {
        for path in [&self.data, &self.index, &self.log] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove cache file {:?}: {}", path, e),
            }
        }
    }
}

/// Encrypted backing storage
pub struct EncryptedStore {
    pub(crate) data: Arc<EncryptedDataFile>,
    pub(crate) log: SectorLog,
    pub(crate) codec: Arc<SectorCodec>,
    pub(crate) extender: Option<SectorExtender>,
}

impl EncryptedStore {
    /// Plaintext of one full sector, from the log if it is pending there
    pub(crate) fn read_sector(&self, sector: u64) -> Result<Vec<u8>> {
        let physical = match self.log.read_physical(sector)? {
            Some(physical) => Some(physical),
            None => self.data.read_physical(sector)?,
        };
        match physical {
            Some(physical) => self.codec.decode(sector, &physical),
            None => Ok(vec![0u8; SECTOR_SIZE as usize]),
        }
    }

    /// Copy `[offset, offset + buf.len())` out of the file into `buf`
    pub(crate) fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        let mut pos = offset;
        while pos < end {
            let sector = sector_of(pos);
            let plain = self.read_sector(sector)?;
            let in_sector = (pos - sector * SECTOR_SIZE) as usize;
            let take = ((SECTOR_SIZE as usize) - in_sector).min((end - pos) as usize);
            let at = (pos - offset) as usize;
            buf[at..at + take].copy_from_slice(&plain[in_sector..in_sector + take]);
            pos += take as u64;
        }
        Ok(())
    }
}

/// Backing storage of a cached file
pub enum DataStore {
    Plain(Arc<File>),
    Encrypted(EncryptedStore),
}

impl DataStore {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, DataStore::Encrypted(_))
    }
}

/// Payload of a handle backed by a local cache file
pub struct CachedFile {
    pub(crate) write_id: u64,
    pub(crate) hash: u64,
    pub(crate) remote_mtime: Option<SystemTime>,
    /// Created on first write when nothing was recovered from the index
    pub(crate) intervals: Option<IntervalTracker>,
    pub(crate) index: IndexFile,
    pub(crate) store: DataStore,
    pub(crate) paths: CachePaths,
}

impl CachedFile {
    /// Record a dirtied range in memory and in the index file
    pub(crate) fn mark_dirty(&mut self, offset: u64, end: u64) -> Result<()> {
        self.intervals
            .get_or_insert_with(IntervalTracker::new)
            .insert(offset..end);
        self.index.append(offset..end)
    }

    pub(crate) fn dirty_segments(&self, size: u64) -> Vec<Segment> {
        match &self.intervals {
            Some(intervals) => intervals.covered_subranges(0..size),
            None if size > 0 => vec![Segment {
                start: 0,
                end: size,
                dirty: false,
            }],
            None => Vec::new(),
        }
    }

    /// Rewrite the index to the merged interval set
    pub(crate) fn compact_index(&mut self) -> Result<()> {
        let empty = IntervalTracker::new();
        let intervals = self.intervals.as_ref().unwrap_or(&empty);
        self.index.rewrite(intervals)?;
        self.index.sync()
    }
}

/// Read-only synthetic content
#[derive(Debug, Clone)]
pub struct StaticFile {
    pub data: Bytes,
    pub ctime: SystemTime,
}

pub enum FileContent {
    Cached(CachedFile),
    Static(StaticFile),
}

/// Everything about an open file that the handle lock protects
pub struct OpenFileState {
    pub(crate) file_id: FileId,
    pub(crate) remote_file_id: Option<u64>,
    pub(crate) folder_id: u64,
    pub(crate) name: String,
    pub(crate) initial_size: u64,
    pub(crate) size: u64,
    pub(crate) content: FileContent,
    pub(crate) streams: StreamCache,
    pub(crate) speed: SpeedMeter,
    pub(crate) refcnt: u32,
    pub(crate) running_reads: u32,
    pub(crate) modified: bool,
    pub(crate) new_file: bool,
    pub(crate) released_for_upload: bool,
    pub(crate) deleted: bool,
    pub(crate) durability: DurabilityState,
    pub(crate) last_use: Instant,
    pub(crate) last_write: Option<Instant>,
    pub(crate) orig_ctime: SystemTime,
}

impl OpenFileState {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn remote_file_id(&self) -> Option<u64> {
        self.remote_file_id
    }

    pub fn folder_id(&self) -> u64 {
        self.folder_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Write id of a cached file; static content has none
    pub fn write_id(&self) -> Option<u64> {
        match &self.content {
            FileContent::Cached(cached) => Some(cached.write_id),
            FileContent::Static(_) => None,
        }
    }

    pub(crate) fn cached(&self) -> Option<&CachedFile> {
        match &self.content {
            FileContent::Cached(cached) => Some(cached),
            FileContent::Static(_) => None,
        }
    }

    pub(crate) fn cached_mut(&mut self) -> Option<&mut CachedFile> {
        match &mut self.content {
            FileContent::Cached(cached) => Some(cached),
            FileContent::Static(_) => None,
        }
    }

    pub(crate) fn encrypted_mut(&mut self) -> Option<&mut EncryptedStore> {
        match self.cached_mut().map(|c| &mut c.store) {
            Some(DataStore::Encrypted(store)) => Some(store),
            _ => None,
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.deleted {
            return Err(Error::Deleted(self.file_id.0));
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_live()?;
        match self.content {
            FileContent::Cached(_) => Ok(()),
            FileContent::Static(_) => Err(Error::ReadOnly(self.file_id.0)),
        }
    }

    /// Bookkeeping shared by every successful local modification
    pub(crate) fn note_modified(&mut self, now: Instant) {
        let durability = match self.cached_mut() {
            Some(cached) => {
                cached.write_id += 1;
                if cached.store.is_encrypted() {
                    DurabilityState::PendingLog
                } else {
                    DurabilityState::Dirty
                }
            }
            None => return,
        };
        self.durability.advance(durability);
        self.modified = true;
        self.released_for_upload = false;
        self.last_write = Some(now);
        self.last_use = now;
    }

    pub(crate) fn set_location(&mut self, folder_id: u64, name: &str) {
        self.folder_id = folder_id;
        self.name = name.to_string();
    }

    /// Take over the identity of a finished upload and forget local dirt
    pub(crate) fn apply_upload(
        &mut self,
        new_id: FileId,
        remote_id: u64,
        hash: u64,
        size: u64,
        mtime: SystemTime,
        new_paths: CachePaths,
    ) -> Result<()> {
        let file_id = self.file_id;
        let cached = self.cached_mut().ok_or(Error::ReadOnly(file_id.0))?;
        if cached.paths != new_paths {
            cached.paths.rename_to(&new_paths)?;
            cached.paths = new_paths;
        }
        cached.hash = hash;
        cached.remote_mtime = Some(mtime);
        cached.intervals = None;
        cached.compact_index()?;

        self.file_id = new_id;
        self.remote_file_id = Some(remote_id);
        self.initial_size = size;
        self.new_file = false;
        self.modified = false;
        self.released_for_upload = false;
        self.durability.advance(DurabilityState::Clean);
        Ok(())
    }

    pub(crate) fn extender(&self) -> Option<&SectorExtender> {
        match self.cached().map(|c| &c.store) {
            Some(DataStore::Encrypted(store)) => store.extender.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn is_extending(&self) -> bool {
        self.extender().is_some()
    }

    /// A modified file becomes uploadable once writes have paused for `delay`
    pub fn ready_for_upload(&self, now: Instant, delay: Duration) -> bool {
        if self.deleted || !self.modified || self.released_for_upload {
            return false;
        }
        if self.is_extending() {
            return false;
        }
        self.last_write
            .map(|at| now.saturating_duration_since(at) >= delay)
            .unwrap_or(true)
    }
}

/// What the uploader has to send for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    pub file_id: FileId,
    /// Compare against the write id when the upload completes
    pub write_id: u64,
    pub size: u64,
    pub new_file: bool,
    /// Dirty segments must be sent, clean ones can be copied remotely
    pub segments: Vec<Segment>,
}

/// Point-in-time snapshot of a handle
#[derive(Debug, Clone)]
pub struct OpenFileInfo {
    pub file_id: FileId,
    pub remote_file_id: Option<u64>,
    pub folder_id: u64,
    pub name: String,
    pub size: u64,
    pub initial_size: u64,
    pub write_id: Option<u64>,
    pub hash: Option<u64>,
    pub remote_mtime: Option<SystemTime>,
    pub refcnt: u32,
    pub running_reads: u32,
    pub modified: bool,
    pub new_file: bool,
    pub released_for_upload: bool,
    pub deleted: bool,
    pub encrypted: bool,
    pub is_static: bool,
    pub throttled: bool,
    /// An encrypted file is being zero-extended
    pub extending: bool,
    /// Callers blocked until that extension settles
    pub extend_waiters: u32,
    pub durability: DurabilityState,
    pub dirty_ranges: Vec<std::ops::Range<u64>>,
    /// Log records since the last checkpoint, for encrypted files
    pub log_entries: Option<u64>,
    pub current_speed: u64,
    pub orig_ctime: SystemTime,
}

impl From<&OpenFileState> for OpenFileInfo {
    fn from(st: &OpenFileState) -> Self {
        let cached = st.cached();
        let log_entries = cached.and_then(|c| match &c.store {
            DataStore::Encrypted(store) => Some(store.log.entries()),
            DataStore::Plain(_) => None,
        });
        OpenFileInfo {
            file_id: st.file_id,
            remote_file_id: st.remote_file_id,
            folder_id: st.folder_id,
            name: st.name.clone(),
            size: st.size,
            initial_size: st.initial_size,
            write_id: st.write_id(),
            hash: cached.map(|c| c.hash),
            remote_mtime: cached.and_then(|c| c.remote_mtime),
            refcnt: st.refcnt,
            running_reads: st.running_reads,
            modified: st.modified,
            new_file: st.new_file,
            released_for_upload: st.released_for_upload,
            deleted: st.deleted,
            encrypted: log_entries.is_some(),
            is_static: cached.is_none(),
            throttled: st.streams.is_throttled(),
            extending: st.is_extending(),
            extend_waiters: st.extender().map_or(0, |e| e.waiters),
            durability: st.durability,
            dirty_ranges: cached
                .and_then(|c| c.intervals.as_ref())
                .map(|i| i.iter().collect())
                .unwrap_or_default(),
            log_entries,
            current_speed: st.speed.current_speed(),
            orig_ctime: match &st.content {
                FileContent::Static(file) => file.ctime,
                FileContent::Cached(_) => st.orig_ctime,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted_is_terminal() {
        let mut state = DurabilityState::Clean;
        assert!(state.advance(DurabilityState::Dirty));
        assert!(state.advance(DurabilityState::Reconciled));
        assert!(state.advance(DurabilityState::Deleted));
        assert!(!state.advance(DurabilityState::Clean));
        assert_eq!(state, DurabilityState::Deleted);
    }

    #[test]
    fn test_cache_paths() {
        let paths = CachePaths::new(Path::new("/cache"), FileId::from_task(9));
        assert_eq!(paths.data, PathBuf::from("/cache/t9.data"));
        assert_eq!(paths.index, PathBuf::from("/cache/t9.idx"));
        assert_eq!(paths.log, PathBuf::from("/cache/t9.log"));

        let paths = CachePaths::new(Path::new("/cache"), FileId(12));
        assert_eq!(paths.data, PathBuf::from("/cache/f12.data"));
    }
}
