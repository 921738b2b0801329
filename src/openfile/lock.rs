//! Handle lock with holder diagnostics
//!
//! Debug builds (and release builds with the `lock-diagnostics` feature)
//! acquire the handle mutex with a timeout. A handle that cannot be locked
//! within the configured time is assumed deadlocked: the current and
//! previous holders are logged and the process aborts.

use super::{OpenFile, OpenFileState};
use parking_lot::MutexGuard;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::time::Instant;
#[cfg(any(debug_assertions, feature = "lock-diagnostics"))]
use tracing::error;

/// Who took a handle lock, and where
#[derive(Debug, Clone)]
pub struct LockHolder {
    pub thread: String,
    pub location: &'static Location<'static>,
    pub since: Instant,
}

impl LockHolder {
    fn current(location: &'static Location<'static>) -> Self {
        let thread = std::thread::current();
        LockHolder {
            thread: thread
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", thread.id())),
            location,
            since: Instant::now(),
        }
    }
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "thread {} at {}:{} ({:?} ago)",
            self.thread,
            self.location.file(),
            self.location.line(),
            self.since.elapsed()
        )
    }
}

#[derive(Debug, Default)]
pub(crate) struct Holders {
    current: Option<LockHolder>,
    previous: Option<LockHolder>,
}

impl Holders {
    fn acquired(&mut self, location: &'static Location<'static>) {
        self.current = Some(LockHolder::current(location));
    }

    fn released(&mut self) {
        if let Some(holder) = self.current.take() {
            self.previous = Some(holder);
        }
    }
}

/// Exclusive access to one handle's state
pub struct OpenFileGuard<'a> {
    file: &'a OpenFile,
    guard: MutexGuard<'a, OpenFileState>,
    location: &'static Location<'static>,
}

impl OpenFile {
    /// Lock the handle
    #[track_caller]
    pub fn lock(&self) -> OpenFileGuard<'_> {
        let location = Location::caller();

        #[cfg(any(debug_assertions, feature = "lock-diagnostics"))]
        let guard = match self.state.try_lock_for(self.lock_timeout) {
            Some(guard) => guard,
            None => self.deadlock(location),
        };
        #[cfg(not(any(debug_assertions, feature = "lock-diagnostics")))]
        let guard = self.state.lock();

        self.holders.lock().acquired(location);
        OpenFileGuard {
            file: self,
            guard,
            location,
        }
    }

    #[cfg(any(debug_assertions, feature = "lock-diagnostics"))]
    #[cold]
    fn deadlock(&self, location: &'static Location<'static>) -> ! {
        let holders = self.holders.lock();
        let describe = |h: &Option<LockHolder>| {
            h.as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string())
        };
        error!(
            file = self.id.load(std::sync::atomic::Ordering::Relaxed),
            waiter = %LockHolder::current(location),
            holder = %describe(&holders.current),
            previous = %describe(&holders.previous),
            timeout = ?self.lock_timeout,
            "Could not lock open file, assuming deadlock; aborting"
        );
        std::process::abort();
    }

    /// Current holder of the handle lock, if any
    pub fn lock_holder(&self) -> Option<LockHolder> {
        self.holders.lock().current.clone()
    }
}

impl<'a> OpenFileGuard<'a> {
    pub(crate) fn file(&self) -> &'a OpenFile {
        self.file
    }

    /// Run `f` with the handle lock released
    pub(crate) fn unlocked<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.file.holders.lock().released();
        let result = MutexGuard::unlocked(&mut self.guard, f);
        self.file.holders.lock().acquired(self.location);
        result
    }

    /// Block on the extend condition variable, releasing the lock meanwhile
    pub(crate) fn wait_extend(&mut self) {
        self.file.holders.lock().released();
        self.file.extend_cv.wait(&mut self.guard);
        self.file.holders.lock().acquired(self.location);
    }

    pub(crate) fn notify_extend(&self) {
        self.file.extend_cv.notify_all();
    }

    /// Add a reference while already holding the lock
    pub fn inc_refcnt_locked(&mut self) {
        self.guard.refcnt += 1;
    }
}

impl Deref for OpenFileGuard<'_> {
    type Target = OpenFileState;

    fn deref(&self) -> &OpenFileState {
        &self.guard
    }
}

impl DerefMut for OpenFileGuard<'_> {
    fn deref_mut(&mut self) -> &mut OpenFileState {
        &mut self.guard
    }
}

impl Drop for OpenFileGuard<'_> {
    fn drop(&mut self) {
        self.file.holders.lock().released();
    }
}
