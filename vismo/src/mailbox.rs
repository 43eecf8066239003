//! # Frame mailbox
//!
//! Three-slot handoff between the capture thread and the processing thread,
//! plus a result queue read by any number of polling consumers. Every slot
//! holds a value copy; no references ever cross a thread boundary.
//!
//! The capture side always wins: submitting over an unprocessed frame drops
//! the older one. The processing side therefore always picks up the newest
//! available frame and processed timestamps are strictly increasing.

use crate::frame::Frame;
use crate::pose::RobotState;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned mailbox still holds valid frames
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug)]
struct Entry {
    frame: Frame,
    state: RobotState,
}

#[derive(Debug, Default)]
struct Slots {
    /// Most recently submitted, not yet picked up.
    next: Option<Entry>,
    /// Picked up by the processing thread, result pending.
    current: Option<Entry>,
    /// Most recently finished.
    last: Option<Entry>,
}

/// Frame slots and result queue shared between the pipeline threads.
///
/// `R` is the per-frame result bundle published by the processing thread.
#[derive(Debug)]
pub struct FrameMailbox<R> {
    slots: Mutex<Slots>,
    results: Mutex<VecDeque<R>>,
}

impl<R> Default for FrameMailbox<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> FrameMailbox<R> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            results: Mutex::new(VecDeque::new()),
        }
    }

    /// Hand a captured frame to the processing side.
    ///
    /// If the previous submission was never picked up it is dropped in
    /// favour of the newer frame. Dropping is the intended overload policy,
    /// not a fault.
    pub fn submit_frame(&self, frame: Frame, state: RobotState) {
        let mut slots = lock(&self.slots);
        if let Some(old) = slots.next.replace(Entry { frame, state }) {
            log::debug!(
                "dropping unprocessed frame at {} ms for a newer one",
                old.frame.timestamp_ms
            );
        }
    }

    /// Retire the frame being processed and pick up the next one.
    ///
    /// Called by the processing thread once per iteration: the previously
    /// returned frame moves to the "last" slot, and the newest submission
    /// (if any) becomes current and is returned by value. At most one frame
    /// is ever in flight.
    pub fn advance(&self) -> Option<(Frame, RobotState)> {
        let mut slots = lock(&self.slots);
        if let Some(done) = slots.current.take() {
            slots.last = Some(done);
        }
        let entry = slots.next.take()?;
        let out = (entry.frame.clone(), entry.state);
        slots.current = Some(entry);
        Some(out)
    }

    /// Copy of the frame currently being processed, if it is strictly newer
    /// than `newer_than`.
    pub fn try_get_current(&self, newer_than: u32) -> Option<(Frame, RobotState)> {
        let slots = lock(&self.slots);
        slots
            .current
            .as_ref()
            .filter(|e| e.frame.timestamp_ms > newer_than)
            .map(|e| (e.frame.clone(), e.state))
    }

    /// Copy of the most recently finished frame, if it is strictly newer
    /// than `newer_than`.
    pub fn try_get_last(&self, newer_than: u32) -> Option<(Frame, RobotState)> {
        let slots = lock(&self.slots);
        slots
            .last
            .as_ref()
            .filter(|e| e.frame.timestamp_ms > newer_than)
            .map(|e| (e.frame.clone(), e.state))
    }

    /// Publish one result bundle.
    pub fn push_result(&self, result: R) {
        lock(&self.results).push_back(result);
    }

    /// Non-blocking poll of the oldest unread result.
    pub fn try_pop_result(&self) -> Option<R> {
        lock(&self.results).pop_front()
    }
}
