//! Open file handles
//!
//! One [`OpenFile`] exists per file that somebody currently has open. It
//! binds the local cache files to the in-memory state needed to serve reads
//! and writes: size, write id, dirty intervals, read streams and, for
//! encrypted files, the sector log.
//!
//! All state sits behind a single per-handle lock (see [`OpenFile::lock`]).
//! The handle is torn down by whichever thread drops the reference count to
//! zero; teardown folds the sector log, compacts the index, marks the handle
//! closed and unlinks it from the registry table.

mod extender;
mod io;
mod lock;
mod state;

pub use extender::{ExtendState, SectorExtender};
pub use io::ReadOutcome;
pub use lock::{LockHolder, OpenFileGuard};
pub use state::{
    CachePaths, CachedFile, DataStore, DurabilityState, EncryptedStore, FileContent,
    OpenFileInfo, OpenFileState, StaticFile, UploadPlan,
};

use crate::config::Config;
use crate::crypto::SectorCodec;
use crate::error::{Error, Result};
use crate::interval::IndexFile;
use crate::registry::{FileTable, OpenRequest};
use crate::sectorlog::{recover, EncryptedDataFile, SectorLog};
use crate::stream::{SpeedMeter, StreamCache};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Local identity of a file
///
/// Positive ids are remote file ids. Files that only exist locally, waiting
/// for their creating upload task, use the negated task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub i64);

impl FileId {
    pub fn from_task(task_id: u64) -> Self {
        FileId(-(task_id as i64))
    }

    /// Task id for a file that has not been uploaded yet
    pub fn task_id(self) -> Option<u64> {
        (self.0 < 0).then(|| self.0.unsigned_abs())
    }

    /// File name stem used for cache files
    pub fn cache_stem(self) -> String {
        match self.task_id() {
            Some(task) => format!("t{}", task),
            None => format!("f{}", self.0),
        }
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file currently open by at least one caller
pub struct OpenFile {
    state: Mutex<OpenFileState>,
    /// Paired with `state` for extension waits
    extend_cv: Condvar,
    /// Set once teardown has run; checked under the handle lock
    closed: AtomicBool,
    /// Mirror of the state's file id for lock diagnostics
    id: AtomicI64,
    holders: Mutex<lock::Holders>,
    lock_timeout: Duration,
    max_file_size: u64,
    checkpoint_threshold: usize,
    extend_batch_sectors: u64,
    table: Weak<FileTable>,
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

impl OpenFile {
    fn with_state(state: OpenFileState, config: &Config, table: Weak<FileTable>) -> Arc<Self> {
        Arc::new(OpenFile {
            id: AtomicI64::new(state.file_id.0),
            state: Mutex::new(state),
            extend_cv: Condvar::new(),
            closed: AtomicBool::new(false),
            holders: Mutex::new(lock::Holders::default()),
            lock_timeout: config.locking.timeout(),
            max_file_size: config.cache.max_file_size,
            checkpoint_threshold: config.encryption.checkpoint_threshold,
            extend_batch_sectors: config.encryption.extend_batch_sectors.max(1),
            table,
        })
    }

    /// Build a handle over the cache files of `req`, recovering whatever a
    /// previous session left behind. The handle starts with one reference.
    pub(crate) fn open(
        req: &OpenRequest,
        config: &Config,
        table: Weak<FileTable>,
    ) -> Result<Arc<Self>> {
        let paths = CachePaths::new(&config.cache.cache_dir, req.file_id);
        let now = Instant::now();

        let index_file = open_rw(&paths.index)?;
        if req.new_file {
            index_file.set_len(0)?;
        }
        let (index, mut intervals) = IndexFile::load(index_file)?;

        let (store, size) = match &req.key {
            Some(key) => {
                let data_file = open_rw(&paths.data)?;
                if req.new_file {
                    data_file.set_len(0)?;
                }
                let data = EncryptedDataFile::open(data_file)?;
                let log_key = key.log_key()?;

                // A new file starts from nothing; the fresh log below drops any leftover records
                if !req.new_file && paths.log.exists() {
                    let report = recover(&open_rw(&paths.log)?, &data, &log_key)?;
                    if report.applied > 0 || report.stopped.is_some() {
                        info!(
                            file = %req.file_id,
                            applied = report.applied,
                            discarded_bytes = report.discarded_bytes,
                            size = report.size,
                            "Recovered sector log"
                        );
                    }
                }
                let log = SectorLog::create(open_rw(&paths.log)?, log_key)?;
                let size = data.read_size()?;
                let store = EncryptedStore {
                    data: Arc::new(data),
                    log,
                    codec: Arc::new(SectorCodec::new(key)?),
                    extender: None,
                };
                (DataStore::Encrypted(store), size)
            }
            None => {
                let data_file = open_rw(&paths.data)?;
                if req.new_file {
                    data_file.set_len(0)?;
                }
                let size = if req.new_file { 0 } else { req.size };
                (DataStore::Plain(Arc::new(data_file)), size)
            }
        };

        if size > config.cache.max_file_size {
            return Err(Error::FileTooLarge {
                size,
                limit: config.cache.max_file_size,
            });
        }

        intervals.truncate(size);
        let modified = !intervals.is_empty();
        let state = OpenFileState {
            file_id: req.file_id,
            remote_file_id: req.remote_file_id,
            folder_id: req.folder_id,
            name: req.name.clone(),
            initial_size: size,
            size,
            content: FileContent::Cached(CachedFile {
                write_id: 0,
                hash: req.hash,
                remote_mtime: req.mtime,
                intervals: (!intervals.is_empty()).then_some(intervals),
                index,
                store,
                paths,
            }),
            streams: StreamCache::new(config.streams.clone()),
            speed: SpeedMeter::new(now),
            refcnt: 1,
            running_reads: 0,
            modified,
            new_file: req.new_file,
            released_for_upload: false,
            deleted: false,
            durability: if modified {
                DurabilityState::Reconciled
            } else {
                DurabilityState::Clean
            },
            last_use: now,
            last_write: None,
            orig_ctime: req.ctime,
        };

        debug!(
            file = %req.file_id,
            name = %req.name,
            size,
            encrypted = req.key.is_some(),
            "Created open file"
        );
        Ok(Self::with_state(state, config, table))
    }

    /// Handle serving fixed in-memory content
    pub(crate) fn open_static(
        file_id: FileId,
        folder_id: u64,
        name: &str,
        data: Bytes,
        ctime: SystemTime,
        config: &Config,
        table: Weak<FileTable>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let size = data.len() as u64;
        let state = OpenFileState {
            file_id,
            remote_file_id: None,
            folder_id,
            name: name.to_string(),
            initial_size: size,
            size,
            content: FileContent::Static(StaticFile { data, ctime }),
            streams: StreamCache::new(config.streams.clone()),
            speed: SpeedMeter::new(now),
            refcnt: 1,
            running_reads: 0,
            modified: false,
            new_file: false,
            released_for_upload: false,
            deleted: false,
            durability: DurabilityState::Clean,
            last_use: now,
            last_write: None,
            orig_ctime: ctime,
        };
        Self::with_state(state, config, table)
    }

    /// Whether teardown has already run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: FileId) {
        self.id.store(id.0, Ordering::Relaxed);
    }

    pub fn inc_refcnt(&self) {
        self.lock().inc_refcnt_locked();
    }

    /// Drop one reference, tearing the handle down at zero
    pub fn dec_refcnt(self: &Arc<Self>) {
        let mut st = self.lock();
        if self.is_closed() {
            warn!(file = %st.file_id, "Reference dropped on a closed open file");
            return;
        }
        debug_assert!(st.refcnt > 0);
        st.refcnt = st.refcnt.saturating_sub(1);
        if st.refcnt == 0 {
            self.teardown(st);
        }
    }

    /// Take a reference on behalf of a read that will run unlocked
    pub fn inc_refcnt_and_readers(&self) {
        let mut st = self.lock();
        st.refcnt += 1;
        st.running_reads += 1;
    }

    pub fn dec_refcnt_and_readers(self: &Arc<Self>) {
        let mut st = self.lock();
        if self.is_closed() {
            warn!(file = %st.file_id, "Reader reference dropped on a closed open file");
            return;
        }
        debug_assert!(st.refcnt > 0 && st.running_reads > 0);
        st.running_reads = st.running_reads.saturating_sub(1);
        st.refcnt = st.refcnt.saturating_sub(1);
        if st.refcnt == 0 {
            self.teardown(st);
        }
    }

    fn teardown(self: &Arc<Self>, mut st: OpenFileGuard<'_>) {
        let file_id = st.file_id;
        if let Err(e) = Self::finalize(&mut st) {
            error!(file = %file_id, "Failed to finalize open file: {}", e);
        }
        self.closed.store(true, Ordering::Release);
        drop(st);

        // The registry lock is only taken after the handle lock is gone
        if let Some(table) = self.table.upgrade() {
            table.remove_if(&file_id, |_, handle| Arc::ptr_eq(handle, self));
        }
        debug!(file = %file_id, "Closed open file");
    }

    fn finalize(st: &mut OpenFileState) -> Result<()> {
        st.streams.clear();
        if st.deleted {
            if let Some(cached) = st.cached() {
                cached.paths.remove_all();
            }
            return Ok(());
        }
        io::reconcile(st)
    }

    /// Mark the file deleted and interrupt any pending extension
    ///
    /// Returns false if it was already deleted.
    pub fn mark_deleted(&self) -> bool {
        let mut st = self.lock();
        if st.deleted {
            return false;
        }
        st.deleted = true;
        st.durability.advance(DurabilityState::Deleted);
        st.streams.clear();

        let killed = st
            .encrypted_mut()
            .and_then(|store| store.extender.as_mut())
            .map(SectorExtender::kill)
            .unwrap_or(false);
        if killed {
            st.notify_extend();
        }
        info!(file = %st.file_id, name = %st.name, killed_extend = killed, "Open file marked deleted");
        true
    }

    /// Snapshot of the handle's state
    pub fn info(&self) -> OpenFileInfo {
        OpenFileInfo::from(&*self.lock())
    }

    /// See [`OpenFileState::ready_for_upload`]
    pub fn ready_for_upload(&self, now: Instant, delay: Duration) -> bool {
        self.lock().ready_for_upload(now, delay)
    }

    pub fn write_id(&self) -> Option<u64> {
        self.lock().write_id()
    }
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("id", &self.id.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::FileKey;
    use crate::registry::OpenRequest;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config) {
        let temp = TempDir::new().unwrap();
        let config = Config::with_cache_dir(temp.path());
        (temp, config)
    }

    #[test]
    fn test_file_id_stems() {
        assert_eq!(FileId::from_task(5), FileId(-5));
        assert_eq!(FileId::from_task(5).task_id(), Some(5));
        assert_eq!(FileId(5).task_id(), None);
        assert_eq!(FileId(5).cache_stem(), "f5");
        assert_eq!(FileId::from_task(5).cache_stem(), "t5");
    }

    #[test]
    fn test_refcount_teardown_syncs_and_closes() {
        let (_temp, config) = setup();
        let req = OpenRequest::new(FileId(1), 0, "a.txt").new_file();
        let of = OpenFile::open(&req, &config, Weak::new()).unwrap();

        of.inc_refcnt();
        of.dec_refcnt();
        assert!(!of.is_closed());
        of.dec_refcnt();
        assert!(of.is_closed());
    }

    #[test]
    fn test_reader_reference_delays_teardown() {
        let (_temp, config) = setup();
        let req = OpenRequest::new(FileId(1), 0, "a.txt").new_file();
        let of = OpenFile::open(&req, &config, Weak::new()).unwrap();

        of.inc_refcnt_and_readers();
        of.dec_refcnt();
        assert!(!of.is_closed());
        assert_eq!(of.info().running_reads, 1);

        of.dec_refcnt_and_readers();
        assert!(of.is_closed());
    }

    #[test]
    fn test_deleted_handle_removes_cache_files_on_close() {
        let (_temp, config) = setup();
        let req = OpenRequest::new(FileId(3), 0, "gone")
            .new_file()
            .encrypted(FileKey::generate());
        let of = OpenFile::open(&req, &config, Weak::new()).unwrap();
        let paths = CachePaths::new(&config.cache.cache_dir, FileId(3));
        assert!(paths.data.exists() && paths.log.exists() && paths.index.exists());

        assert!(of.mark_deleted());
        assert!(!of.mark_deleted());
        assert_eq!(of.info().durability, DurabilityState::Deleted);
        of.dec_refcnt();

        assert!(!paths.data.exists());
        assert!(!paths.log.exists());
        assert!(!paths.index.exists());
    }

    #[test]
    fn test_release_after_close_leaves_new_handle_alone() {
        let (_temp, config) = setup();
        let req = OpenRequest::new(FileId(5), 0, "reused").new_file();
        let old = OpenFile::open(&req, &config, Weak::new()).unwrap();
        old.mark_deleted();
        old.dec_refcnt();
        assert!(old.is_closed());

        let fresh = OpenFile::open(&req, &config, Weak::new()).unwrap();
        fresh.write(0, b"fresh").unwrap();
        old.dec_refcnt();
        old.dec_refcnt_and_readers();

        let paths = CachePaths::new(&config.cache.cache_dir, FileId(5));
        assert!(paths.data.exists() && paths.index.exists());
        assert!(!fresh.is_closed());
        assert_eq!(fresh.info().refcnt, 1);
        assert_eq!(&fresh.read(0, 5).unwrap().data[..], b"fresh");
    }

    #[test]
    fn test_new_file_ignores_leftover_log() {
        let (_temp, config) = setup();
        let key = FileKey::generate();
        let req = OpenRequest::new(FileId(6), 0, "again").new_file().encrypted(key.clone());
        let crashed = OpenFile::open(&req, &config, Weak::new()).unwrap();
        crashed.write(0, &[7u8; 100]).unwrap();
        assert_eq!(crashed.info().log_entries, Some(1));
        // Never released, so the log keeps its record
        drop(crashed);

        let of = OpenFile::open(&req, &config, Weak::new()).unwrap();
        let info = of.info();
        assert_eq!(info.size, 0);
        assert_eq!(info.log_entries, Some(0));
        assert!(of.read(0, 100).unwrap().data.is_empty());
        drop(of);

        // Nothing of the old log comes back on a later recovery either
        let req = OpenRequest::new(FileId(6), 0, "again").encrypted(key);
        let of = OpenFile::open(&req, &config, Weak::new()).unwrap();
        assert_eq!(of.info().size, 0);
    }

    #[test]
    fn test_encrypted_contents_survive_reopen() {
        let (_temp, config) = setup();
        let key = FileKey::generate();
        let req = OpenRequest::new(FileId(4), 0, "enc").new_file().encrypted(key.clone());
        let of = OpenFile::open(&req, &config, Weak::new()).unwrap();
        of.write(0, b"hello").unwrap();
        of.dec_refcnt();

        // Reopen with the same key: data survives teardown's checkpoint
        let req = OpenRequest::new(FileId(4), 0, "enc").encrypted(key);
        let of = OpenFile::open(&req, &config, Weak::new()).unwrap();
        assert_eq!(of.info().size, 5);
        assert_eq!(&of.read(0, 5).unwrap().data[..], b"hello");
    }

    #[test]
    fn test_lock_holder_is_recorded() {
        let (_temp, config) = setup();
        let req = OpenRequest::new(FileId(1), 0, "a").new_file();
        let of = OpenFile::open(&req, &config, Weak::new()).unwrap();

        assert!(of.lock_holder().is_none());
        let guard = of.lock();
        let holder = of.lock_holder().unwrap();
        assert!(holder.location.file().ends_with("mod.rs"));
        drop(guard);
        assert!(of.lock_holder().is_none());
    }
}
