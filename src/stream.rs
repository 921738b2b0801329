//! Read stream tracking
//!
//! Each open file remembers a handful of recent read windows. A read that
//! starts at or just past the trailing edge of a window extends it and is
//! treated as sequential; anything else starts a new window, replacing the
//! least recently used one when all slots are taken.
//!
//! Sequential streams earn growing read-ahead. Random or stalled access
//! flips the file into throttled mode, where the read path fetches only
//! what was asked for in small requests.

use crate::config::{StreamConfig, PAGE_SIZE};
use std::time::Instant;
use tracing::trace;

/// One detected read window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub id: u64,
    /// First page covered
    pub from_page: u64,
    /// One past the last page covered
    pub to_page: u64,
    /// Bytes read through this stream
    pub length: u64,
    /// Byte offset read-ahead has been requested up to
    pub requested_to: u64,
    pub last_use: Instant,
    /// Logical clock for LRU ordering
    tick: u64,
}

/// What the read path should do for one read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPlan {
    pub stream_id: u64,
    /// The read continued an existing stream
    pub sequential: bool,
    /// File-wide throttle flag after this read
    pub throttle: bool,
    /// Fetch data up to this byte offset (request end plus any read-ahead)
    pub fetch_to: u64,
    /// Largest single request the read path should issue
    pub max_request: u64,
}

/// Fixed-capacity set of read streams for one file
#[derive(Debug)]
pub struct StreamCache {
    config: StreamConfig,
    streams: Vec<Option<Stream>>,
    last_stream_id: u64,
    tick: u64,
    throttle: bool,
}

fn page_of(offset: u64) -> u64 {
    offset / PAGE_SIZE
}

fn page_end(end: u64) -> u64 {
    end.div_ceil(PAGE_SIZE)
}

impl StreamCache {
    pub fn new(config: StreamConfig) -> Self {
        let capacity = config.streams_per_file.max(1);
        StreamCache {
            config,
            streams: vec![None; capacity],
            last_stream_id: 0,
            tick: 0,
            throttle: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.streams.len()
    }

    pub fn is_throttled(&self) -> bool {
        self.throttle
    }

    /// Streams currently tracked, most recently used first
    pub fn streams(&self) -> Vec<&Stream> {
        let mut active: Vec<&Stream> = self.streams.iter().flatten().collect();
        active.sort_by(|a, b| b.tick.cmp(&a.tick));
        active
    }

    /// Record a read of `length` bytes at `offset`
    pub fn touch(&mut self, offset: u64, length: u64, now: Instant) -> ReadPlan {
        self.expire(now);
        self.tick += 1;

        let end = offset.saturating_add(length.max(1));
        let first = page_of(offset);
        let last = page_end(end);

        let matched = self.streams.iter_mut().flatten().find(|s| {
            first >= s.from_page && first <= s.to_page
        });

        let max_readahead = self.config.max_readahead;
        let min_readahead = self.config.min_readahead;
        let tick = self.tick;

        let extended = matched.map(|stream| {
            // Starting in the last page or right after it keeps the stream sequential
            let sequential = first + 1 >= stream.to_page;
            stream.to_page = stream.to_page.max(last);
            stream.length += length;
            stream.last_use = now;
            stream.tick = tick;

            let mut fetch_to = end;
            if sequential && end >= stream.requested_to {
                let window = stream.length.clamp(min_readahead, max_readahead);
                stream.requested_to = end.saturating_add(window);
                fetch_to = stream.requested_to;
            }

            trace!(
                stream = stream.id,
                offset,
                length,
                sequential,
                requested_to = stream.requested_to,
                "Stream extended"
            );

            (stream.id, sequential, fetch_to)
        });

        match extended {
            Some((stream_id, sequential, fetch_to)) => {
                if sequential {
                    self.throttle = false;
                }
                ReadPlan {
                    stream_id,
                    sequential,
                    throttle: self.throttle,
                    fetch_to,
                    max_request: self.max_request(),
                }
            }
            None => {
                self.throttle = true;
                let stream_id = self.start_stream(first, last, length, end, now);
                trace!(stream = stream_id, offset, length, "New stream");
                ReadPlan {
                    stream_id,
                    sequential: false,
                    throttle: true,
                    fetch_to: end,
                    max_request: self.max_request(),
                }
            }
        }
    }

    /// Forget every stream (used on truncate and teardown)
    pub fn clear(&mut self) {
        for slot in &mut self.streams {
            *slot = None;
        }
    }

    fn max_request(&self) -> u64 {
        if self.throttle {
            self.config.throttled_fetch
        } else {
            self.config.max_readahead
        }
    }

    fn start_stream(&mut self, first: u64, last: u64, length: u64, end: u64, now: Instant) -> u64 {
        self.last_stream_id += 1;
        let stream = Stream {
            id: self.last_stream_id,
            from_page: first,
            to_page: last,
            length,
            requested_to: end,
            last_use: now,
            tick: self.tick,
        };

        let slot = match self.streams.iter().position(Option::is_none) {
            Some(free) => free,
            None => self
                .streams
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.tick)))
                .min_by_key(|&(_, tick)| tick)
                .map(|(i, _)| i)
                .unwrap_or(0),
        };

        self.streams[slot] = Some(stream);
        self.last_stream_id
    }

    /// Free streams idle for longer than the stall timeout
    fn expire(&mut self, now: Instant) {
        let timeout = self.config.stall_timeout();
        for slot in &mut self.streams {
            let stalled = slot
                .as_ref()
                .map(|s| now.saturating_duration_since(s.last_use) > timeout)
                .unwrap_or(false);
            if stalled {
                *slot = None;
            }
        }
    }
}

/// Bytes-per-second meter for reads served from one file
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    origin: Instant,
    current_sec: u64,
    bytes_this_sec: u64,
    current_speed: u64,
}

impl SpeedMeter {
    pub fn new(now: Instant) -> Self {
        SpeedMeter {
            origin: now,
            current_sec: 0,
            bytes_this_sec: 0,
            current_speed: 0,
        }
    }

    /// Account `bytes` read at `now`; returns the speed of the last full second
    pub fn record(&mut self, bytes: u64, now: Instant) -> u64 {
        let sec = now.saturating_duration_since(self.origin).as_secs();
        if sec != self.current_sec {
            // A gap of more than one second means nothing was read in between
            self.current_speed = if sec == self.current_sec + 1 {
                self.bytes_this_sec
            } else {
                0
            };
            self.current_sec = sec;
            self.bytes_this_sec = 0;
        }
        self.bytes_this_sec += bytes;
        self.current_speed
    }

    pub fn current_speed(&self) -> u64 {
        self.current_speed
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache(streams: usize) -> StreamCache {
        StreamCache::new(StreamConfig {
            streams_per_file: streams,
            min_readahead: 64 * 1024,
            max_readahead: 1024 * 1024,
            throttled_fetch: 16 * 1024,
            stall_timeout_secs: 5,
        })
    }

    #[test]
    fn test_sequential_reads_share_stream() {
        let mut c = cache(4);
        let now = Instant::now();
        let a = c.touch(0, 4096, now);
        let b = c.touch(4096, 4096, now);
        let d = c.touch(8192, 4096, now);

        assert_eq!(a.stream_id, b.stream_id);
        assert_eq!(b.stream_id, d.stream_id);
        assert!(b.sequential && d.sequential);
        assert!(!d.throttle);
        assert_eq!(c.streams().len(), 1);
    }

    #[test]
    fn test_first_read_is_throttled_until_sequential() {
        let mut c = cache(4);
        let now = Instant::now();
        let first = c.touch(0, 4096, now);
        assert!(first.throttle);
        assert_eq!(first.max_request, 16 * 1024);

        let second = c.touch(4096, 4096, now);
        assert!(!second.throttle);
        assert_eq!(second.max_request, 1024 * 1024);
    }

    #[test]
    fn test_readahead_requested_when_target_reached() {
        let mut c = cache(4);
        let now = Instant::now();
        c.touch(0, 4096, now);
        let plan = c.touch(4096, 4096, now);
        assert_eq!(plan.fetch_to, 8192 + 64 * 1024);

        // Still inside the requested window: no new extension
        let plan = c.touch(8192, 4096, now);
        assert_eq!(plan.fetch_to, 12288);
    }

    #[test]
    fn test_random_access_throttles() {
        let mut c = cache(4);
        let now = Instant::now();
        c.touch(0, 4096, now);
        c.touch(4096, 4096, now);
        assert!(!c.is_throttled());

        let plan = c.touch(10 * 1024 * 1024, 4096, now);
        assert!(!plan.sequential);
        assert!(plan.throttle);
    }

    #[test]
    fn test_lru_eviction() {
        let mut c = cache(2);
        let now = Instant::now();
        let a = c.touch(0, 4096, now).stream_id;
        let b = c.touch(1 << 20, 4096, now).stream_id;
        // Use `a` again so `b` becomes the oldest
        c.touch(4096, 4096, now);
        let d = c.touch(1 << 30, 4096, now).stream_id;

        let ids: Vec<u64> = c.streams().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![d, a]);
        assert!(!ids.contains(&b));
    }

    #[test]
    fn test_stalled_streams_expire() {
        let mut c = cache(2);
        let start = Instant::now();
        c.touch(0, 4096, start);
        c.touch(4096, 4096, start);
        assert!(!c.is_throttled());

        // Continuing a stalled stream starts over, throttled
        let later = start + Duration::from_secs(10);
        let plan = c.touch(8192, 4096, later);
        assert!(!plan.sequential);
        assert!(plan.throttle);
        assert_eq!(c.streams().len(), 1);
    }

    #[test]
    fn test_speed_meter() {
        let start = Instant::now();
        let mut m = SpeedMeter::new(start);
        m.record(100, start);
        m.record(50, start + Duration::from_millis(500));
        assert_eq!(m.record(10, start + Duration::from_millis(1100)), 150);
        assert_eq!(m.record(0, start + Duration::from_secs(5)), 0);
    }
}
