//! Read, write and resize paths of an open file

use super::extender::{release_if_settled, ExtendState, SectorExtender};
use super::state::{EncryptedStore, OpenFileState};
use super::{DataStore, DurabilityState, FileContent, OpenFile, OpenFileGuard, UploadPlan};
use crate::config::{PAGE_SIZE, SECTOR_SIZE};
use crate::crypto::{sector_of, sectors_for, SectorCodec};
use crate::error::{Error, Result};
use crate::interval::Segment;
use crate::sectorlog::EncryptedDataFile;
use crate::stream::ReadPlan;
use bytes::Bytes;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Data returned by [`OpenFile::read`]
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// Bytes read, clipped at the logical size
    pub data: Bytes,
    /// Read-ahead decision for this access
    pub plan: ReadPlan,
    /// Dirty and clean pieces of the returned range
    pub segments: Vec<Segment>,
}

enum ReadSource {
    Ready(Bytes),
    Plain(Arc<File>),
}

fn read_plain(file: &File, offset: u64, count: usize) -> Result<Bytes> {
    let mut buf = vec![0u8; count];
    let mut done = 0;
    while done < count {
        let n = file.read_at(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            // Past the end of the local file: a hole, leave zeroes
            break;
        }
        done += n;
    }
    Ok(Bytes::from(buf))
}

/// Re-encrypt every sector touched by `data` at `offset` and log it
fn write_sectors(store: &mut EncryptedStore, size: u64, offset: u64, data: &[u8]) -> Result<()> {
    let end = offset + data.len() as u64;
    let mut pos = offset;
    while pos < end {
        let sector = sector_of(pos);
        let sector_start = sector * SECTOR_SIZE;
        let in_sector = (pos - sector_start) as usize;
        let take = (SECTOR_SIZE as usize - in_sector).min((end - pos) as usize);

        let whole = in_sector == 0 && take == SECTOR_SIZE as usize;
        let mut plain = if !whole && sector_start < size {
            store.read_sector(sector)?
        } else {
            vec![0u8; SECTOR_SIZE as usize]
        };
        let from = (pos - offset) as usize;
        plain[in_sector..in_sector + take].copy_from_slice(&data[from..from + take]);

        let physical = store.codec.encode(sector, &plain)?;
        store
            .log
            .append(sector, &physical, size.max(pos + take as u64))?;
        pos += take as u64;
    }
    Ok(())
}

/// Fold pending local writes into the data file and compact the index
pub(super) fn reconcile(st: &mut OpenFileState) -> Result<()> {
    let size = st.size;
    let Some(cached) = st.cached_mut() else {
        return Ok(());
    };
    match &mut cached.store {
        DataStore::Encrypted(store) => {
            if !store.log.is_empty() {
                store.log.checkpoint(&store.data, size)?;
            }
        }
        DataStore::Plain(file) => file.sync_data()?,
    }
    cached.compact_index()?;
    if matches!(
        st.durability,
        DurabilityState::Dirty | DurabilityState::PendingLog
    ) {
        st.durability.advance(DurabilityState::Reconciled);
    }
    Ok(())
}

impl OpenFile {
    fn check_open(&self, st: &OpenFileState) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StaleHandle(st.file_id.0));
        }
        Ok(())
    }

    /// Read up to `len` bytes at `offset`
    ///
    /// Plain cache files are read with the handle unlocked; the read holds
    /// its own reference meanwhile so the handle cannot be torn down under it.
    pub fn read(self: &Arc<Self>, offset: u64, len: u64) -> Result<ReadOutcome> {
        let now = Instant::now();
        let mut st = self.lock();
        self.check_open(&st)?;
        st.ensure_live()?;

        st.last_use = now;
        let mut plan = st.streams.touch(offset, len, now);
        let end = offset.saturating_add(len).min(st.size);
        if offset >= end {
            return Ok(ReadOutcome {
                data: Bytes::new(),
                plan,
                segments: Vec::new(),
            });
        }
        let count = (end - offset) as usize;
        let speed = st.speed.record(count as u64, now);
        if plan.throttle && speed > 0 {
            // Throttled fetches never ask for more than a second's worth
            plan.max_request = plan.max_request.min(speed.max(PAGE_SIZE));
        }

        let (source, segments) = match &st.content {
            FileContent::Static(file) => (
                ReadSource::Ready(file.data.slice(offset as usize..end as usize)),
                Vec::new(),
            ),
            FileContent::Cached(cached) => {
                let segments = match &cached.intervals {
                    Some(intervals) => intervals.covered_subranges(offset..end),
                    None => vec![Segment {
                        start: offset,
                        end,
                        dirty: false,
                    }],
                };
                let source = match &cached.store {
                    DataStore::Encrypted(store) => {
                        let mut buf = vec![0u8; count];
                        store.read_into(offset, &mut buf)?;
                        ReadSource::Ready(Bytes::from(buf))
                    }
                    DataStore::Plain(file) => ReadSource::Plain(Arc::clone(file)),
                };
                (source, segments)
            }
        };

        let data = match source {
            ReadSource::Ready(data) => data,
            ReadSource::Plain(file) => {
                st.refcnt += 1;
                st.running_reads += 1;
                drop(st);
                let result = read_plain(&file, offset, count);
                self.dec_refcnt_and_readers();
                result?
            }
        };

        trace!(offset, len = data.len(), stream = plan.stream_id, "Read");
        Ok(ReadOutcome {
            data,
            plan,
            segments,
        })
    }

    /// Write `data` at `offset`, returning the number of bytes written
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let len = data.len() as u64;
        let end = offset.checked_add(len).ok_or(Error::InvalidRange {
            offset,
            length: len,
        })?;
        let now = Instant::now();

        let mut st = self.lock();
        self.check_open(&st)?;
        st.ensure_writable()?;
        if end > self.max_file_size {
            return Err(Error::FileTooLarge {
                size: end,
                limit: self.max_file_size,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }

        let dirty_from = offset.min(st.size);
        let mut folded = false;
        if st.encrypted_mut().is_some() {
            self.settle_extension(&mut st, end)?;
            if offset > st.size {
                self.extend_locked(&mut st, offset)?;
            }
            st.ensure_live()?;
            let size = st.size;
            let store = st
                .encrypted_mut()
                .ok_or_else(|| Error::Internal("encrypted store vanished".to_string()))?;
            write_sectors(store, size, offset, data)?;
            if store.log.pending_sectors() >= self.checkpoint_threshold && store.extender.is_none() {
                store.log.checkpoint(&store.data, size.max(end))?;
                folded = true;
            }
        } else if let Some(cached) = st.cached() {
            if let DataStore::Plain(file) = &cached.store {
                file.write_all_at(data, offset)?;
            }
        }

        st.size = st.size.max(end);
        st.note_modified(now);
        if folded {
            st.durability.advance(DurabilityState::Reconciled);
            debug!(file = %st.file_id, "Eager sector log checkpoint");
        }
        self.finish_write(&mut st, dirty_from, end, len)
    }

    fn finish_write(&self, st: &mut OpenFileGuard<'_>, from: u64, end: u64, len: u64) -> Result<usize> {
        if let Some(cached) = st.cached_mut() {
            cached.mark_dirty(from, end)?;
        }
        trace!(file = %st.file_id, from, end, write_id = ?st.write_id(), "Write");
        Ok(len as usize)
    }

    /// Resize the file
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let now = Instant::now();
        let mut st = self.lock();
        self.check_open(&st)?;
        st.ensure_writable()?;
        if new_size > self.max_file_size {
            return Err(Error::FileTooLarge {
                size: new_size,
                limit: self.max_file_size,
            });
        }

        if st.encrypted_mut().is_some() {
            self.settle_extension(&mut st, u64::MAX)?;
            st.ensure_live()?;
        }
        let old_size = st.size;
        if new_size == old_size {
            return Ok(());
        }

        if st.encrypted_mut().is_some() {
            if new_size > old_size {
                self.extend_locked(&mut st, new_size)?;
                st.ensure_live()?;
            } else if let Some(store) = st.encrypted_mut() {
                store.log.checkpoint(&store.data, new_size)?;
                store.data.truncate_sectors(sectors_for(new_size))?;
            }
        } else if let Some(cached) = st.cached() {
            if let DataStore::Plain(file) = &cached.store {
                file.set_len(new_size)?;
            }
        }

        st.size = new_size;
        st.streams.clear();
        st.note_modified(now);
        if let Some(cached) = st.cached_mut() {
            if new_size > old_size {
                cached.mark_dirty(old_size, new_size)?;
            } else if let Some(intervals) = cached.intervals.as_mut() {
                intervals.truncate(new_size);
                cached.compact_index()?;
            }
        }
        debug!(file = %st.file_id, old_size, new_size, "Truncated");
        Ok(())
    }

    /// Fold pending writes into the data file and sync it
    pub fn flush(&self) -> Result<()> {
        let mut st = self.lock();
        self.check_open(&st)?;
        st.ensure_live()?;
        reconcile(&mut st)
    }

    /// Hand the file to the uploader
    ///
    /// Waits for any extension in progress, folds pending writes and
    /// returns what has to be uploaded. The returned write id must be
    /// passed back when the upload completes.
    pub fn release_for_upload(&self) -> Result<UploadPlan> {
        let mut st = self.lock();
        self.check_open(&st)?;
        st.ensure_writable()?;
        if st.encrypted_mut().is_some() {
            self.settle_extension(&mut st, u64::MAX)?;
            st.ensure_live()?;
        }
        reconcile(&mut st)?;
        st.released_for_upload = true;

        let size = st.size;
        let cached = st
            .cached()
            .ok_or(Error::ReadOnly(st.file_id.0))?;
        let plan = UploadPlan {
            file_id: st.file_id,
            write_id: cached.write_id,
            size,
            new_file: st.new_file,
            segments: cached.dirty_segments(size),
        };
        debug!(file = %plan.file_id, write_id = plan.write_id, size, "Released for upload");
        Ok(plan)
    }

    /// Wait until no extension blocks a write ending at `end`
    ///
    /// Only a caller that waited on an extension reports its failure. An
    /// extension that had already settled when the caller arrived belongs
    /// to its registered waiters; the caller parks until they have left and
    /// then goes on to extend the file itself.
    fn settle_extension(&self, st: &mut OpenFileGuard<'_>, end: u64) -> Result<()> {
        loop {
            st.ensure_live()?;
            let file_id = st.file_id.0;
            let Some(store) = st.encrypted_mut() else {
                return Ok(());
            };
            let Some(ext) = store.extender.as_mut() else {
                return Ok(());
            };
            if !ext.blocks(end) {
                return Ok(());
            }
            if ext.state.is_terminal() {
                if ext.waiters == 0 {
                    store.extender = None;
                    continue;
                }
                trace!(file = file_id, extender = ext.id(), "Waiting for settled extension to drain");
                st.wait_extend();
                continue;
            }

            let id = ext.id();
            ext.waiters += 1;
            trace!(file = file_id, extender = id, end, "Waiting for extension");
            st.wait_extend();

            let Some(store) = st.encrypted_mut() else {
                return Ok(());
            };
            let (outcome, released) = match store.extender.as_mut() {
                Some(ext) if ext.id() == id => {
                    ext.waiters = ext.waiters.saturating_sub(1);
                    let outcome = ext.state.is_terminal().then(|| ext.outcome(file_id));
                    release_if_settled(&mut store.extender);
                    (outcome, store.extender.is_none())
                }
                _ => (None, false),
            };
            if released {
                st.notify_extend();
            }
            if let Some(outcome) = outcome {
                outcome?;
            }
        }
    }

    /// Grow an encrypted file to `target`, zero-filling the gap
    ///
    /// Must be called with no extension pending. Whole new sectors are
    /// written in batches with the lock released; the logical size only
    /// moves once every sector is in place.
    fn extend_locked(&self, st: &mut OpenFileGuard<'_>, target: u64) -> Result<()> {
        let file_id = st.file_id;
        let start = st.size;
        let store = st
            .encrypted_mut()
            .ok_or_else(|| Error::Internal("extend on unencrypted file".to_string()))?;

        let tail = start % SECTOR_SIZE;
        if tail != 0 {
            let sector = sector_of(start);
            let mut plain = store.read_sector(sector)?;
            plain[tail as usize..].fill(0);
            let physical = store.codec.encode(sector, &plain)?;
            store.log.append(sector, &physical, start)?;
        }

        let extender = SectorExtender::new(start, target);
        let id = extender.id();
        store.extender = Some(extender);
        let data = Arc::clone(&store.data);
        let codec = Arc::clone(&store.codec);
        debug!(file = %file_id, start, target, extender = id, "Extending encrypted file");

        let result = self.fill_extension(st, id, start, target, &data, &codec);

        if let Some(store) = st.encrypted_mut() {
            if let Some(ext) = store.extender.as_mut().filter(|e| e.id() == id) {
                match &result {
                    Ok(()) => ext.finish(),
                    Err(Error::ExtendKilled(_)) => {
                        ext.kill();
                    }
                    Err(e) => ext.fail(e.to_string()),
                }
            }
            release_if_settled(&mut store.extender);
        }
        st.notify_extend();

        if let Err(e) = &result {
            warn!(file = %file_id, target, "Extension did not complete: {}", e);
        }
        result
    }

    fn fill_extension(
        &self,
        st: &mut OpenFileGuard<'_>,
        id: u64,
        start: u64,
        target: u64,
        data: &EncryptedDataFile,
        codec: &SectorCodec,
    ) -> Result<()> {
        let file_id = st.file_id.0;
        let last = sectors_for(target);
        let mut next = sectors_for(start);

        while next < last {
            let upto = (next + self.extend_batch_sectors).min(last);
            let range = next..upto;
            st.unlocked(|| -> Result<()> {
                for sector in range {
                    data.write_physical(sector, &codec.encode(sector, &[])?)?;
                }
                Ok(())
            })?;

            let ext = st
                .encrypted_mut()
                .and_then(|s| s.extender.as_mut())
                .filter(|e| e.id() == id)
                .ok_or(Error::ExtendKilled(file_id))?;
            if ext.state == ExtendState::Killed {
                return Err(Error::ExtendKilled(file_id));
            }
            ext.extended_to = (upto * SECTOR_SIZE).min(target);
            next = upto;
        }

        data.sync()?;
        let store = st
            .encrypted_mut()
            .ok_or_else(|| Error::Internal("encrypted store vanished".to_string()))?;
        store.log.checkpoint(&store.data, target)?;
        st.size = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::FileKey;
    use crate::registry::OpenRequest;
    use crate::FileId;
    use std::sync::Weak;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn plain(temp: &TempDir) -> Arc<OpenFile> {
        let config = Config::with_cache_dir(temp.path());
        let req = OpenRequest::new(FileId(1), 0, "plain").new_file();
        OpenFile::open(&req, &config, Weak::new()).unwrap()
    }

    fn encrypted(temp: &TempDir, config: &Config) -> Arc<OpenFile> {
        let req = OpenRequest::new(FileId(2), 0, "secret")
            .new_file()
            .encrypted(FileKey::generate());
        OpenFile::open(&req, config, Weak::new()).unwrap()
    }

    #[test]
    fn test_plain_write_read() {
        let temp = TempDir::new().unwrap();
        let of = plain(&temp);
        assert_eq!(of.write(0, b"hello world").unwrap(), 11);

        let out = of.read(6, 100).unwrap();
        assert_eq!(&out.data[..], b"world");
        assert_eq!(
            out.segments,
            vec![Segment {
                start: 6,
                end: 11,
                dirty: true
            }]
        );
        assert_eq!(of.info().durability, DurabilityState::Dirty);
        assert_eq!(of.info().running_reads, 0);
    }

    #[test]
    fn test_write_ids_increase() {
        let temp = TempDir::new().unwrap();
        let of = plain(&temp);
        let mut last = of.write_id().unwrap();
        for i in 0..5 {
            of.write(i * 10, b"x").unwrap();
            let now = of.write_id().unwrap();
            assert!(now > last);
            last = now;
        }
        of.truncate(3).unwrap();
        assert!(of.write_id().unwrap() > last);
    }

    #[test]
    fn test_encrypted_spanning_write_logs_two_sectors() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_cache_dir(temp.path());
        let of = encrypted(&temp, &config);

        of.write(4090, b"0123456789").unwrap();
        let info = of.info();
        assert_eq!(info.log_entries, Some(2));
        assert_eq!(info.size, 4100);
        assert_eq!(info.durability, DurabilityState::PendingLog);

        let out = of.read(4090, 10).unwrap();
        assert_eq!(&out.data[..], b"0123456789");
        // The gap before the write reads as zeroes
        assert!(of.read(0, 4090).unwrap().data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_encrypted_flush_reconciles() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_cache_dir(temp.path());
        let of = encrypted(&temp, &config);

        of.write(0, b"abc").unwrap();
        of.flush().unwrap();
        let info = of.info();
        assert_eq!(info.log_entries, Some(0));
        assert_eq!(info.durability, DurabilityState::Reconciled);
        assert_eq!(&of.read(0, 3).unwrap().data[..], b"abc");
    }

    #[test]
    fn test_eager_checkpoint_at_threshold() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::with_cache_dir(temp.path());
        config.encryption.checkpoint_threshold = 4;
        let of = encrypted(&temp, &config);

        of.write(0, &vec![1u8; 3 * SECTOR_SIZE as usize]).unwrap();
        assert_eq!(of.info().log_entries, Some(3));
        of.write(3 * SECTOR_SIZE, b"data").unwrap();
        let info = of.info();
        assert_eq!(info.log_entries, Some(0));
        assert_eq!(info.durability, DurabilityState::Reconciled);
        assert_eq!(&of.read(3 * SECTOR_SIZE, 4).unwrap().data[..], b"data");
    }

    #[test]
    fn test_encrypted_extend_and_shrink() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::with_cache_dir(temp.path());
        config.encryption.extend_batch_sectors = 2;
        let of = encrypted(&temp, &config);

        of.write(0, &[0xAA; 5000]).unwrap();
        of.truncate(100).unwrap();
        of.truncate(10 * SECTOR_SIZE + 7).unwrap();

        let info = of.info();
        assert_eq!(info.size, 10 * SECTOR_SIZE + 7);
        let out = of.read(0, info.size).unwrap();
        assert!(out.data[..100].iter().all(|b| *b == 0xAA));
        // Bytes cut off by the shrink must not come back
        assert!(out.data[100..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_write_past_end_extends_encrypted_file() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_cache_dir(temp.path());
        let of = encrypted(&temp, &config);

        of.write(0, b"head").unwrap();
        of.write(3 * SECTOR_SIZE + 1, b"tail").unwrap();

        let out = of.read(0, 4 * SECTOR_SIZE).unwrap();
        assert_eq!(out.data.len() as u64, 3 * SECTOR_SIZE + 5);
        assert_eq!(&out.data[..4], b"head");
        assert!(out.data[4..(3 * SECTOR_SIZE + 1) as usize].iter().all(|b| *b == 0));
        assert_eq!(&out.data[(3 * SECTOR_SIZE + 1) as usize..], b"tail");
    }

    #[test]
    fn test_deleted_handle_rejects_io() {
        let temp = TempDir::new().unwrap();
        let of = plain(&temp);
        of.write(0, b"abc").unwrap();
        of.mark_deleted();

        assert!(matches!(of.read(0, 3), Err(Error::Deleted(1))));
        assert!(matches!(of.write(0, b"x"), Err(Error::Deleted(1))));
        assert!(matches!(of.truncate(0), Err(Error::Deleted(1))));
        assert!(matches!(of.release_for_upload(), Err(Error::Deleted(1))));
    }

    #[test]
    fn test_release_for_upload_plan() {
        let temp = TempDir::new().unwrap();
        let of = plain(&temp);
        of.write(0, b"aaaa").unwrap();
        of.write(10, b"bbbb").unwrap();
        assert!(of.ready_for_upload(Instant::now() + std::time::Duration::from_secs(5), std::time::Duration::from_secs(3)));

        let plan = of.release_for_upload().unwrap();
        assert_eq!(plan.size, 14);
        assert!(plan.new_file);
        assert_eq!(plan.write_id, of.write_id().unwrap());
        assert_eq!(
            plan.segments,
            vec![
                Segment { start: 0, end: 4, dirty: true },
                Segment { start: 4, end: 10, dirty: false },
                Segment { start: 10, end: 14, dirty: true },
            ]
        );
        assert!(!of.ready_for_upload(Instant::now(), std::time::Duration::ZERO));

        // A new write makes it uploadable again
        of.write(0, b"c").unwrap();
        assert!(!of.info().released_for_upload);
    }

    #[test]
    fn test_read_clips_at_size() {
        let temp = TempDir::new().unwrap();
        let of = plain(&temp);
        of.write(0, b"abc").unwrap();
        assert!(of.read(3, 10).unwrap().data.is_empty());
        assert_eq!(of.read(1, 10).unwrap().data.len(), 2);
    }

    /// Put a pending extension from the current size to `target` in place
    fn pending_extension(of: &OpenFile, target: u64) {
        let mut st = of.lock();
        let start = st.size;
        let store = st.encrypted_mut().unwrap();
        assert!(store.extender.is_none());
        store.extender = Some(SectorExtender::new(start, target));
    }

    fn wait_for_waiters(of: &OpenFile, count: u32) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while of.info().extend_waiters != count {
            assert!(Instant::now() < deadline, "no writer waited on the extension");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Settle the pending extension with `settle` and wake its waiters
    fn settle(of: &OpenFile, apply: impl FnOnce(&mut OpenFileState, &mut SectorExtender)) {
        let mut st = of.lock();
        let mut ext = st.encrypted_mut().unwrap().extender.take().unwrap();
        apply(&mut *st, &mut ext);
        st.encrypted_mut().unwrap().extender = Some(ext);
        st.notify_extend();
    }

    #[test]
    fn test_writer_proceeds_once_extension_is_ready() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_cache_dir(temp.path());
        let of = encrypted(&temp, &config);
        of.write(0, &[1u8; 100]).unwrap();
        pending_extension(&of, 200);

        let writer = {
            let of = Arc::clone(&of);
            thread::spawn(move || of.write(150, b"tail"))
        };
        wait_for_waiters(&of, 1);
        assert!(!writer.is_finished());
        settle(&of, |st, ext| {
            ext.finish();
            st.size = ext.target;
        });

        assert_eq!(writer.join().unwrap().unwrap(), 4);
        let info = of.info();
        assert!(!info.extending);
        assert_eq!(info.extend_waiters, 0);
        assert_eq!(info.size, 200);
        let out = of.read(0, 200).unwrap();
        assert!(out.data[..100].iter().all(|b| *b == 1));
        assert!(out.data[100..150].iter().all(|b| *b == 0));
        assert_eq!(&out.data[150..154], b"tail");
    }

    #[test]
    fn test_failed_extension_reaches_waiting_writer() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_cache_dir(temp.path());
        let of = encrypted(&temp, &config);
        of.write(0, &[1u8; 100]).unwrap();
        pending_extension(&of, 200);

        let writer = {
            let of = Arc::clone(&of);
            thread::spawn(move || of.write(150, b"tail"))
        };
        wait_for_waiters(&of, 1);
        settle(&of, |_, ext| ext.fail("disk full"));

        match writer.join().unwrap() {
            Err(Error::ExtendFailed { target, reason, .. }) => {
                assert_eq!(target, 200);
                assert_eq!(reason, "disk full");
            }
            other => panic!("unexpected result {:?}", other),
        }
        // The last waiter removed the extender; the file is usable again
        assert!(!of.info().extending);
        assert_eq!(of.info().size, 100);
        of.write(150, b"tail").unwrap();
        assert_eq!(of.info().size, 154);
        assert_eq!(&of.read(150, 4).unwrap().data[..], b"tail");
    }

    #[test]
    fn test_delete_wakes_waiting_writer() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_cache_dir(temp.path());
        let of = encrypted(&temp, &config);
        of.write(0, &[1u8; 100]).unwrap();
        pending_extension(&of, 200);

        let writer = {
            let of = Arc::clone(&of);
            thread::spawn(move || of.write(150, b"tail"))
        };
        wait_for_waiters(&of, 1);
        assert!(of.mark_deleted());

        assert!(matches!(writer.join().unwrap(), Err(Error::ExtendKilled(2))));
        assert!(!of.info().extending);
    }

    #[test]
    fn test_settled_extension_does_not_fail_later_writers() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_cache_dir(temp.path());
        let of = encrypted(&temp, &config);
        of.write(0, &[1u8; 100]).unwrap();
        pending_extension(&of, 200);
        // Failed, with one waiter that has not woken up yet
        settle(&of, |_, ext| {
            ext.fail("disk full");
            ext.waiters = 1;
        });

        let late = {
            let of = Arc::clone(&of);
            thread::spawn(move || of.write(150, b"late"))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!late.is_finished());

        // The waiter leaves
        {
            let mut st = of.lock();
            let store = st.encrypted_mut().unwrap();
            let ext = store.extender.as_mut().unwrap();
            ext.waiters -= 1;
            assert!(ext.outcome(2).is_err());
            release_if_settled(&mut store.extender);
            assert!(store.extender.is_none());
            st.notify_extend();
        }

        assert_eq!(late.join().unwrap().unwrap(), 4);
        assert_eq!(&of.read(150, 4).unwrap().data[..], b"late");
    }

    #[test]
    fn test_closed_handle_is_stale() {
        let temp = TempDir::new().unwrap();
        let of = plain(&temp);
        of.dec_refcnt();
        assert!(matches!(of.write(0, b"x"), Err(Error::StaleHandle(1))));
        assert!(matches!(of.read(0, 1), Err(Error::StaleHandle(1))));
    }
}
