//! Process-wide table of open files
//!
//! Handles are keyed by [`FileId`] in a sharded map. Shard locks are held
//! only for single map operations and never while a handle is locked or a
//! cache file is opened: lookups clone the handle out of its shard before
//! locking it, and teardown releases the handle lock before it unlinks the
//! handle from its shard.
//!
//! Building a handle and re-keying one after an upload both run under a
//! per-id gate, so at most one live handle is ever installed for an id.
//! Teardown marks a handle closed under its own lock before it is removed
//! from the table, so a lookup that finds a closed handle in the window
//! between the two simply replaces it with a fresh one.

use crate::config::Config;
use crate::crypto::FileKey;
use crate::error::{Error, Result};
use crate::openfile::{CachePaths, FileId, OpenFile, OpenFileGuard};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub(crate) type FileTable = DashMap<FileId, Arc<OpenFile>>;

/// Everything needed to open a file
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub file_id: FileId,
    pub remote_file_id: Option<u64>,
    pub folder_id: u64,
    pub name: String,
    /// Remote size, ignored for encrypted and new files
    pub size: u64,
    pub hash: u64,
    pub mtime: Option<SystemTime>,
    pub ctime: SystemTime,
    /// Present for files encrypted at rest
    pub key: Option<FileKey>,
    /// The file is being created locally
    pub new_file: bool,
}

impl OpenRequest {
    pub fn new(file_id: FileId, folder_id: u64, name: impl Into<String>) -> Self {
        OpenRequest {
            file_id,
            remote_file_id: (file_id.0 > 0).then_some(file_id.0 as u64),
            folder_id,
            name: name.into(),
            size: 0,
            hash: 0,
            mtime: None,
            ctime: SystemTime::now(),
            key: None,
            new_file: false,
        }
    }

    pub fn new_file(mut self) -> Self {
        self.new_file = true;
        self
    }

    pub fn encrypted(mut self, key: FileKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn remote(mut self, size: u64, hash: u64, mtime: SystemTime) -> Self {
        self.size = size;
        self.hash = hash;
        self.mtime = Some(mtime);
        self
    }
}

/// Result of reconciling a handle with a finished upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// Newer local writes happened while the upload ran
    Stale,
    NotFound,
    /// The remote id is already open under another handle
    Conflict,
}

/// Registry of open files
pub struct OpenFileRegistry {
    files: Arc<FileTable>,
    /// Per-id gates held while a live handle is built or re-keyed
    opening: DashMap<FileId, Arc<Mutex<()>>>,
    config: Arc<Config>,
}

impl OpenFileRegistry {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        config.ensure_directories()?;
        Ok(OpenFileRegistry {
            files: Arc::new(DashMap::new()),
            opening: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of handles in the table
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Handle for `file_id` without taking a reference
    pub fn get(&self, file_id: FileId) -> Option<Arc<OpenFile>> {
        self.files.get(&file_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Return the open handle for `req.file_id`, taking a reference, or
    /// open the file and register a new handle with one reference.
    pub fn lookup_or_create(&self, req: &OpenRequest) -> Result<Arc<OpenFile>> {
        if let Some(handle) = self.take_reference(req.file_id)? {
            return Ok(handle);
        }
        self.create_with(req.file_id, || {
            OpenFile::open(req, &self.config, Arc::downgrade(&self.files))
        })
    }

    /// Register a read-only handle serving `data`
    pub fn open_static(
        &self,
        file_id: FileId,
        folder_id: u64,
        name: &str,
        data: Bytes,
        ctime: SystemTime,
    ) -> Result<Arc<OpenFile>> {
        if let Some(handle) = self.take_reference(file_id)? {
            return Ok(handle);
        }
        self.create_with(file_id, || {
            Ok(OpenFile::open_static(
                file_id,
                folder_id,
                name,
                data,
                ctime,
                &self.config,
                Arc::downgrade(&self.files),
            ))
        })
    }

    /// Take a reference on the live handle registered for `file_id`
    ///
    /// No table lock is held while the handle is locked.
    fn take_reference(&self, file_id: FileId) -> Result<Option<Arc<OpenFile>>> {
        let Some(handle) = self.get(file_id) else {
            return Ok(None);
        };
        let mut st = handle.lock();
        if handle.is_closed() {
            return Ok(None);
        }
        if st.is_deleted() {
            return Err(Error::Deleted(file_id.0));
        }
        st.inc_refcnt_locked();
        drop(st);
        Ok(Some(handle))
    }

    /// Open a handle for `file_id` unless another opener got there first
    fn create_with<F>(&self, file_id: FileId, open: F) -> Result<Arc<OpenFile>>
    where
        F: FnOnce() -> Result<Arc<OpenFile>>,
    {
        let gate = self.gate(file_id);
        let result = {
            let _opening = gate.lock();
            match self.take_reference(file_id) {
                Ok(Some(handle)) => Ok(handle),
                Ok(None) => open().map(|fresh| self.install(file_id, fresh)),
                Err(e) => Err(e),
            }
        };
        self.close_gate(file_id, gate);
        result
    }

    /// Insert a handle built under the gate of `file_id`
    fn install(&self, file_id: FileId, fresh: Arc<OpenFile>) -> Arc<OpenFile> {
        match self.files.entry(file_id) {
            Entry::Occupied(mut entry) => {
                debug_assert!(entry.get().is_closed());
                debug!(file = %file_id, "Replacing closed open file");
                entry.insert(Arc::clone(&fresh));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&fresh));
            }
        }
        fresh
    }

    /// Gate serializing everything that installs a live handle under `file_id`
    fn gate(&self, file_id: FileId) -> Arc<Mutex<()>> {
        Arc::clone(self.opening.entry(file_id).or_default().value())
    }

    /// Drop the gate once nobody else is waiting on it
    fn close_gate(&self, file_id: FileId, gate: Arc<Mutex<()>>) {
        self.opening.remove_if(&file_id, |_, held| {
            Arc::ptr_eq(held, &gate) && Arc::strong_count(held) == 2
        });
    }

    /// Drop a reference obtained from this registry
    pub fn release(&self, handle: &Arc<OpenFile>) {
        handle.dec_refcnt();
    }

    /// Mark the file of an upload or rename task deleted. Idempotent.
    pub fn mark_deleted_by_task(&self, task_id: u64) {
        if let Some(handle) = self.get(FileId::from_task(task_id)) {
            handle.mark_deleted();
        }
    }

    /// Record a confirmed rename; the caller holds the handle lock
    pub fn rename_locked(
        &self,
        guard: &mut OpenFileGuard<'_>,
        folder_id: u64,
        name: &str,
    ) -> Result<()> {
        if guard.file().is_closed() {
            return Err(Error::NotFound(guard.file_id().0));
        }
        debug!(
            file = %guard.file_id(),
            from = %guard.name(),
            to = name,
            folder_id,
            "Renamed open file"
        );
        guard.set_location(folder_id, name);
        Ok(())
    }

    pub fn rename(&self, file_id: FileId, folder_id: u64, name: &str) -> Result<()> {
        let handle = self.get(file_id).ok_or(Error::NotFound(file_id.0))?;
        let mut guard = handle.lock();
        self.rename_locked(&mut guard, folder_id, name)
    }

    /// Rename reported by the task with `task_id`
    pub fn on_task_renamed(&self, task_id: u64, folder_id: u64, name: &str) -> Result<()> {
        self.rename(FileId::from_task(task_id), folder_id, name)
    }

    /// Write id of the file behind `task_id`, snapshotted before an upload starts
    pub fn current_write_id(&self, task_id: u64) -> Option<u64> {
        let handle = self.get(FileId::from_task(task_id))?;
        let st = handle.lock();
        if handle.is_closed() {
            return None;
        }
        st.write_id()
    }

    /// Reconcile a handle after its upload task finished
    ///
    /// The upload carried the data as of `write_id`. If the file changed
    /// since, the result is stale and nothing is touched. Otherwise the
    /// handle takes the remote identity and metadata, its dirty intervals
    /// are cleared and it is re-keyed under the new file id.
    pub fn update_after_upload(
        &self,
        task_id: u64,
        write_id: u64,
        new_remote_id: u64,
        hash: u64,
        size: u64,
        mtime: SystemTime,
    ) -> Result<UpdateOutcome> {
        let old_id = FileId::from_task(task_id);
        let Some(handle) = self.get(old_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        let new_id = FileId(new_remote_id as i64);

        let gate = self.gate(new_id);
        let outcome = {
            let _opening = gate.lock();
            self.rekey(&handle, old_id, new_id, write_id, |st| {
                let new_paths = CachePaths::new(&self.config.cache.cache_dir, new_id);
                st.apply_upload(new_id, new_remote_id, hash, size, mtime, new_paths)
            })
        };
        self.close_gate(new_id, gate);
        let outcome = outcome?;
        if outcome != UpdateOutcome::Updated {
            return Ok(outcome);
        }

        info!(task_id, file = %new_id, write_id, size, "Open file updated after upload");
        Ok(UpdateOutcome::Updated)
    }

    /// Move `handle` from `old_id` to `new_id`; the caller holds the gate of `new_id`
    fn rekey<F>(
        &self,
        handle: &Arc<OpenFile>,
        old_id: FileId,
        new_id: FileId,
        write_id: u64,
        apply: F,
    ) -> Result<UpdateOutcome>
    where
        F: FnOnce(&mut OpenFileGuard<'_>) -> Result<()>,
    {
        if let Some(occupant) = self.get(new_id) {
            if !Arc::ptr_eq(&occupant, handle) && !occupant.is_closed() {
                warn!(
                    file = %old_id,
                    remote = %new_id,
                    "Uploaded file id is already open, keeping local identity"
                );
                return Ok(UpdateOutcome::Conflict);
            }
        }

        {
            let mut st = handle.lock();
            if handle.is_closed() {
                return Ok(UpdateOutcome::NotFound);
            }
            match st.write_id() {
                None => return Ok(UpdateOutcome::NotFound),
                Some(current) if current != write_id => {
                    info!(
                        file = %old_id,
                        uploaded = write_id,
                        current,
                        "Upload result is stale, keeping local metadata"
                    );
                    return Ok(UpdateOutcome::Stale);
                }
                Some(_) => {}
            }
            apply(&mut st)?;
            handle.set_id(new_id);
        }

        self.files.insert(new_id, Arc::clone(handle));
        self.files
            .remove_if(&old_id, |_, existing| Arc::ptr_eq(existing, handle));
        // A release that tore the handle down before the insert found nothing to unlink
        if handle.is_closed() {
            self.files
                .remove_if(&new_id, |_, existing| Arc::ptr_eq(existing, handle));
        }
        Ok(UpdateOutcome::Updated)
    }
}
