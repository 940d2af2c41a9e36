//! Cancellable Timers
//!
//! Every delayed action (countdowns, invitation expiry, round gaps, result
//! settling) is an entry in a [`TimerQueue`]. Scheduling returns a
//! [`TimerHandle`]; the object that armed the timer keeps the handle and
//! cancels it on every transition that supersedes it.
//!
//! A fired entry carries its handle. Owners compare it against the handle
//! they hold, so an entry that was re-armed in the meantime is recognized as
//! stale and ignored.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Identifies one scheduled timer. Never reused within a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Deadline-ordered timer queue.
#[derive(Debug)]
pub struct TimerQueue<K> {
    next_id: u64,
    by_deadline: BTreeMap<(Instant, u64), K>,
    deadlines: HashMap<u64, Instant>,
}

impl<K> TimerQueue<K> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Arm a timer firing `key` at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, key: K) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.by_deadline.insert((deadline, id), key);
        self.deadlines.insert(id, deadline);
        TimerHandle(id)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.deadlines.remove(&handle.0) {
            Some(deadline) => self.by_deadline.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    /// Cancel the timer held in `slot` (if any) and clear the slot.
    pub fn disarm(&mut self, slot: &mut Option<TimerHandle>) -> bool {
        match slot.take() {
            Some(handle) => self.cancel(handle),
            None => false,
        }
    }

    /// Whether the timer is still pending.
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.deadlines.contains_key(&handle.0)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerHandle, K)> {
        let mut due = Vec::new();
        while let Some(entry) = self.by_deadline.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            let key = entry.remove();
            self.deadlines.remove(&id);
            due.push((TimerHandle(id), key));
        }
        due
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
