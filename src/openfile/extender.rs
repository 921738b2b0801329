//! Coordination for growing an encrypted file
//!
//! Growing an encrypted file means zero-filling and encrypting every sector
//! between the old and the new size. The thread doing that releases the
//! handle lock between batches; writers that would land past the old size
//! wait on the handle's condition variable until the extension settles.
//!
//! ```text
//! Pending --finish--> Ready
//!    |  \--I/O error--> Error
//!    \--delete--------> Killed
//! ```
//!
//! Ready, Error and Killed are terminal. The extender is removed from the
//! handle by whoever leaves it last: the extending thread when nobody is
//! waiting, otherwise the last waiter to wake up.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_EXTENDER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendState {
    Pending,
    Ready,
    Error(String),
    Killed,
}

impl ExtendState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExtendState::Pending)
    }
}

#[derive(Debug)]
pub struct SectorExtender {
    id: u64,
    /// Size being extended to
    pub target: u64,
    /// Logical size when the extension started
    pub start_size: u64,
    /// Size initialized so far
    pub extended_to: u64,
    pub waiters: u32,
    pub state: ExtendState,
}

impl SectorExtender {
    pub fn new(start_size: u64, target: u64) -> Self {
        SectorExtender {
            id: NEXT_EXTENDER_ID.fetch_add(1, Ordering::Relaxed),
            target,
            start_size,
            extended_to: start_size,
            waiters: 0,
            state: ExtendState::Pending,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a write ending at `end` has to wait for this extension
    pub fn blocks(&self, end: u64) -> bool {
        end > self.start_size
    }

    /// Mark the extension interrupted. Returns false if it had already settled.
    pub fn kill(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ExtendState::Killed;
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = ExtendState::Error(reason.into());
        }
    }

    pub fn finish(&mut self) {
        if !self.state.is_terminal() {
            self.extended_to = self.target;
            self.state = ExtendState::Ready;
        }
    }

    /// Outcome a waiter reports once it observes a terminal state
    pub fn outcome(&self, file_id: i64) -> Result<()> {
        match &self.state {
            ExtendState::Pending | ExtendState::Ready => Ok(()),
            ExtendState::Error(reason) => Err(Error::ExtendFailed {
                file_id,
                target: self.target,
                reason: reason.clone(),
            }),
            ExtendState::Killed => Err(Error::ExtendKilled(file_id)),
        }
    }
}

/// Remove `slot`'s extender if it has settled and nobody is waiting on it
pub(crate) fn release_if_settled(slot: &mut Option<SectorExtender>) {
    if slot
        .as_ref()
        .map(|e| e.state.is_terminal() && e.waiters == 0)
        .unwrap_or(false)
    {
        *slot = None;
    }
}
