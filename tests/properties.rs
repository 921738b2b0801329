//! Property tests for the dirty-range tracker and the sector log

use proptest::prelude::*;
use std::fs::OpenOptions;
use std::sync::Arc;
use tempfile::TempDir;
use vfsync::config::SECTOR_SIZE;
use vfsync::crypto::{FileKey, SectorCodec};
use vfsync::interval::IntervalTracker;
use vfsync::prelude::*;
use vfsync::sectorlog::{scan_log, SectorLog, StopReason, LOG_HEADER_SIZE, LOG_RECORD_SIZE};

const SPAN: u64 = 256;

fn ranges() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0..SPAN, 0..32u64), 0..40)
}

proptest! {
    #[test]
    fn prop_tracker_matches_bitmap(inserts in ranges(), cut in 0..SPAN + 16) {
        let mut tracker = IntervalTracker::new();
        let mut model = vec![false; (SPAN + 32) as usize];
        for &(start, len) in &inserts {
            tracker.insert(start..start + len);
            for b in start..start + len {
                model[b as usize] = true;
            }
        }

        // Sorted, disjoint and never touching
        let spans: Vec<_> = tracker.iter().collect();
        for pair in spans.windows(2) {
            prop_assert!(pair[0].end < pair[1].start);
        }
        prop_assert!(spans.iter().all(|r| r.start < r.end));

        let covered: u64 = model.iter().filter(|&&d| d).count() as u64;
        prop_assert_eq!(tracker.total_bytes(), covered);
        for r in &spans {
            prop_assert!((r.start..r.end).all(|b| model[b as usize]));
        }

        // Segments tile the query exactly and agree with the model
        let segments = tracker.covered_subranges(0..SPAN);
        let mut pos = 0;
        for seg in &segments {
            prop_assert_eq!(seg.start, pos);
            prop_assert!((seg.start..seg.end).all(|b| model[b as usize] == seg.dirty));
            pos = seg.end;
        }
        prop_assert_eq!(pos, SPAN);

        tracker.truncate(cut);
        prop_assert!(tracker.iter().all(|r| r.end <= cut));
        let kept = model.iter().take(cut as usize).filter(|&&d| d).count() as u64;
        prop_assert_eq!(tracker.total_bytes(), kept);
    }

    #[test]
    fn prop_log_prefix_survives_truncation(sectors in prop::collection::vec(0..8u64, 1..6), cut in 0.0f64..1.0) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("prop.log");
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path).unwrap();
        let key = FileKey::from_bytes([7; 32]);
        let codec = SectorCodec::new(&key).unwrap();
        let log_key = key.log_key().unwrap();

        let mut log = SectorLog::create(file, log_key).unwrap();
        for (i, &sector) in sectors.iter().enumerate() {
            let physical = codec.encode(sector, &[i as u8; 16]).unwrap();
            log.append(sector, &physical, (sector + 1) * SECTOR_SIZE).unwrap();
        }

        let bytes = std::fs::read(&path).unwrap();
        let body = bytes.len() as u64 - LOG_HEADER_SIZE;
        let len = LOG_HEADER_SIZE + (cut * body as f64) as u64;
        let torn = &bytes[..len as usize];
        let scan = scan_log(torn, &log_key);

        let whole = ((len - LOG_HEADER_SIZE) / LOG_RECORD_SIZE) as usize;
        prop_assert_eq!(scan.records.len(), whole);
        for (record, &sector) in scan.records.iter().zip(&sectors) {
            prop_assert_eq!(record.sector(), sector);
        }
        if (len - LOG_HEADER_SIZE) % LOG_RECORD_SIZE != 0 {
            prop_assert_eq!(scan.stopped, Some(StopReason::TornRecord));
        } else {
            prop_assert_eq!(scan.stopped, None);
        }
    }

    #[test]
    fn prop_flipped_byte_stops_replay(sectors in prop::collection::vec(0..8u64, 2..6), victim in any::<prop::sample::Index>(), at in 0..LOG_RECORD_SIZE) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("flip.log");
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path).unwrap();
        let key = FileKey::from_bytes([9; 32]);
        let codec = SectorCodec::new(&key).unwrap();
        let log_key = key.log_key().unwrap();

        let mut log = SectorLog::create(file, log_key).unwrap();
        for &sector in &sectors {
            log.append(sector, &codec.encode(sector, &[]).unwrap(), SECTOR_SIZE).unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        let victim = victim.index(sectors.len());
        let pos = (LOG_HEADER_SIZE + victim as u64 * LOG_RECORD_SIZE + at) as usize;
        bytes[pos] ^= 0x01;

        // Nothing at or after the damaged record is ever applied
        let scan = scan_log(&bytes, &log_key);
        prop_assert_eq!(scan.records.len(), victim);
        prop_assert!(scan.stopped.is_some());
    }

    #[test]
    fn prop_write_ids_strictly_increase(writes in prop::collection::vec((0..10_000u64, 1..64usize), 1..20)) {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(Config::with_cache_dir(temp.path()));
        let registry = OpenFileRegistry::new(config).unwrap();
        let req = OpenRequest::new(FileId::from_task(1), 0, "prop").new_file();
        let handle = registry.lookup_or_create(&req).unwrap();

        let mut last = handle.write_id().unwrap();
        for &(offset, len) in &writes {
            handle.write(offset, &vec![1u8; len]).unwrap();
            let now = handle.write_id().unwrap();
            prop_assert!(now > last);
            last = now;
        }

        // Only the latest write id completes an upload
        let stale = last - 1;
        prop_assert_eq!(
            registry.update_after_upload(1, stale, 10, 0, 0, std::time::SystemTime::now()).unwrap(),
            UpdateOutcome::Stale
        );
        prop_assert_eq!(
            registry.update_after_upload(1, last, 10, 0, 0, std::time::SystemTime::now()).unwrap(),
            UpdateOutcome::Updated
        );
        registry.release(&handle);
    }
}
