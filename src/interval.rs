//! Dirty range tracking
//!
//! Keeps the set of byte ranges modified locally since the last successful
//! upload, as disjoint half-open `[start, end)` intervals. Adjacent and
//! overlapping ranges are merged on insertion, so no two stored ranges ever
//! touch.
//!
//! The set is persisted to a companion index file as a flat sequence of
//! `(offset, length)` records. A damaged index loads as an empty set: the
//! worst case is re-uploading data that was already clean.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use tracing::{debug, warn};

/// Size of one `(offset, length)` index record
pub const INDEX_RECORD_SIZE: u64 = 16;

/// A piece of a queried range, either locally dirty or clean
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    pub dirty: bool,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Ordered set of disjoint dirty intervals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalTracker {
    /// start -> end
    ranges: BTreeMap<u64, u64>,
}

impl IntervalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[range.start, range.end)`, merging with anything it overlaps or abuts
    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }

        let mut start = range.start;
        let mut end = range.end;

        // Every stored range with s <= end and e >= start is absorbed
        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in absorbed {
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }

        self.ranges.insert(start, end);
    }

    /// Whether the whole of `range` is dirty
    pub fn contains(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        match self.ranges.range(..=range.start).next_back() {
            Some((_, &e)) => e >= range.end,
            None => false,
        }
    }

    /// Split `range` into consecutive dirty and clean segments.
    ///
    /// The segments cover `range` exactly, in order, and alternate between
    /// dirty and clean.
    pub fn covered_subranges(&self, range: Range<u64>) -> Vec<Segment> {
        let mut out = Vec::new();
        if range.start >= range.end {
            return out;
        }

        let mut cursor = range.start;

        let preceding = self
            .ranges
            .range(..=range.start)
            .next_back()
            .filter(|(_, &e)| e > range.start)
            .map(|(&s, &e)| (s, e));
        let following = self
            .ranges
            .range(range.start..range.end)
            .map(|(&s, &e)| (s, e))
            .filter(|&(s, _)| Some(s) != preceding.map(|p| p.0));

        for (s, e) in preceding.into_iter().chain(following) {
            let s = s.max(range.start);
            let e = e.min(range.end);
            if s > cursor {
                out.push(Segment {
                    start: cursor,
                    end: s,
                    dirty: false,
                });
            }
            out.push(Segment {
                start: s,
                end: e,
                dirty: true,
            });
            cursor = e;
        }

        if cursor < range.end {
            out.push(Segment {
                start: cursor,
                end: range.end,
                dirty: false,
            });
        }

        out
    }

    /// Drop everything at or beyond `size`
    pub fn truncate(&mut self, size: u64) {
        let beyond: Vec<u64> = self.ranges.range(size..).map(|(&s, _)| s).collect();
        for s in beyond {
            self.ranges.remove(&s);
        }
        if let Some((_, e)) = self.ranges.range_mut(..size).next_back() {
            if *e > size {
                *e = size;
            }
        }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of dirty bytes
    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }
}

fn encode_record(range: &Range<u64>) -> [u8; INDEX_RECORD_SIZE as usize] {
    let mut rec = [0u8; INDEX_RECORD_SIZE as usize];
    rec[..8].copy_from_slice(&range.start.to_le_bytes());
    rec[8..].copy_from_slice(&(range.end - range.start).to_le_bytes());
    rec
}

/// Decode raw index file contents
pub fn decode_index(bytes: &[u8]) -> Result<IntervalTracker> {
    if bytes.len() as u64 % INDEX_RECORD_SIZE != 0 {
        return Err(Error::CorruptIndex(format!(
            "length {} is not a multiple of the record size",
            bytes.len()
        )));
    }

    let mut tracker = IntervalTracker::new();
    for rec in bytes.chunks_exact(INDEX_RECORD_SIZE as usize) {
        let offset = u64::from_le_bytes(rec[..8].try_into().unwrap_or_default());
        let length = u64::from_le_bytes(rec[8..].try_into().unwrap_or_default());
        let end = offset.checked_add(length).ok_or_else(|| {
            Error::CorruptIndex(format!("record {}+{} overflows", offset, length))
        })?;
        if length == 0 {
            return Err(Error::CorruptIndex(format!(
                "zero-length record at {}",
                offset
            )));
        }
        tracker.insert(offset..end);
    }
    Ok(tracker)
}

/// Companion index file holding the dirty intervals of one cached file
pub struct IndexFile {
    file: File,
    /// Append position for the next record
    index_off: u64,
}

impl IndexFile {
    /// Load an index file, returning the recovered intervals.
    ///
    /// A truncated or malformed file is reset to empty. Only real I/O
    /// failures are returned as errors.
    pub fn load(mut file: File) -> Result<(Self, IntervalTracker)> {
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        let tracker = match decode_index(&bytes) {
            Ok(tracker) => tracker,
            Err(e) => {
                warn!("Discarding index file: {}", e);
                file.set_len(0)?;
                bytes.clear();
                IntervalTracker::new()
            }
        };

        debug!(
            "Loaded index: {} records, {} intervals",
            bytes.len() as u64 / INDEX_RECORD_SIZE,
            tracker.len()
        );

        Ok((
            IndexFile {
                file,
                index_off: bytes.len() as u64,
            },
            tracker,
        ))
    }

    /// Record one newly dirtied range
    pub fn append(&mut self, range: Range<u64>) -> Result<()> {
        if range.start >= range.end {
            return Ok(());
        }
        self.file.write_all_at(&encode_record(&range), self.index_off)?;
        self.index_off += INDEX_RECORD_SIZE;
        Ok(())
    }

    /// Replace the file contents with the minimal record set of `tracker`
    pub fn rewrite(&mut self, tracker: &IntervalTracker) -> Result<()> {
        let mut bytes = Vec::with_capacity(tracker.len() * INDEX_RECORD_SIZE as usize);
        for range in tracker.iter() {
            bytes.extend_from_slice(&encode_record(&range));
        }
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        self.index_off = bytes.len() as u64;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Number of records currently stored
    pub fn record_count(&self) -> u64 {
        self.index_off / INDEX_RECORD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn ranges(t: &IntervalTracker) -> Vec<Range<u64>> {
        t.iter().collect()
    }

    #[test]
    fn test_overlapping_writes_merge() {
        let mut t = IntervalTracker::new();
        t.insert(0..100);
        t.insert(50..150);
        assert_eq!(ranges(&t), vec![0..150]);
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut t = IntervalTracker::new();
        t.insert(10..20);
        t.insert(20..30);
        t.insert(0..10);
        assert_eq!(ranges(&t), vec![0..30]);
    }

    #[test]
    fn test_bridge_merges_many() {
        let mut t = IntervalTracker::new();
        t.insert(0..5);
        t.insert(10..15);
        t.insert(20..25);
        t.insert(40..50);
        t.insert(3..22);
        assert_eq!(ranges(&t), vec![0..25, 40..50]);
    }

    #[test]
    fn test_empty_insert_ignored() {
        let mut t = IntervalTracker::new();
        t.insert(5..5);
        assert!(t.is_empty());
    }

    #[test]
    fn test_contains() {
        let mut t = IntervalTracker::new();
        t.insert(10..20);
        assert!(t.contains(10..20));
        assert!(t.contains(12..15));
        assert!(!t.contains(5..15));
        assert!(!t.contains(15..25));
        assert!(t.contains(30..30));
    }

    #[test]
    fn test_covered_subranges() {
        let mut t = IntervalTracker::new();
        t.insert(10..20);
        t.insert(30..40);

        let segs = t.covered_subranges(15..50);
        assert_eq!(
            segs,
            vec![
                Segment { start: 15, end: 20, dirty: true },
                Segment { start: 20, end: 30, dirty: false },
                Segment { start: 30, end: 40, dirty: true },
                Segment { start: 40, end: 50, dirty: false },
            ]
        );

        let segs = t.covered_subranges(0..10);
        assert_eq!(segs, vec![Segment { start: 0, end: 10, dirty: false }]);
    }

    #[test]
    fn test_covered_subranges_starts_on_boundary() {
        let mut t = IntervalTracker::new();
        t.insert(10..20);
        let segs = t.covered_subranges(10..15);
        assert_eq!(segs, vec![Segment { start: 10, end: 15, dirty: true }]);
    }

    #[test]
    fn test_truncate() {
        let mut t = IntervalTracker::new();
        t.insert(0..10);
        t.insert(20..30);
        t.insert(40..50);
        t.truncate(25);
        assert_eq!(ranges(&t), vec![0..10, 20..25]);
        t.truncate(20);
        assert_eq!(ranges(&t), vec![0..10]);
    }

    fn open_rw(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_index_persistence() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.idx");

        let (mut idx, _) = IndexFile::load(open_rw(&path)).unwrap();
        idx.append(0..100).unwrap();
        idx.append(50..150).unwrap();
        idx.append(300..310).unwrap();
        assert_eq!(idx.record_count(), 3);
        drop(idx);

        let (mut idx, tracker) = IndexFile::load(open_rw(&path)).unwrap();
        assert_eq!(ranges(&tracker), vec![0..150, 300..310]);

        idx.rewrite(&tracker).unwrap();
        assert_eq!(idx.record_count(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 32);
    }

    #[test]
    fn test_truncated_index_loads_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.idx");

        let mut bytes = encode_record(&(0..100)).to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        std::fs::write(&path, &bytes).unwrap();

        let (idx, tracker) = IndexFile::load(open_rw(&path)).unwrap();
        assert!(tracker.is_empty());
        assert_eq!(idx.record_count(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_overflowing_record_loads_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.idx");

        let mut rec = [0u8; 16];
        rec[..8].copy_from_slice(&u64::MAX.to_le_bytes());
        rec[8..].copy_from_slice(&10u64.to_le_bytes());
        std::fs::write(&path, rec).unwrap();

        let (_, tracker) = IndexFile::load(open_rw(&path)).unwrap();
        assert!(tracker.is_empty());
    }
}
