//! Tick clock and timeout queue
//!
//! Time is a u64 tick counter advanced only by `Kernel::tick()`; the
//! external timer interrupt layer calls it once per quantum. Every
//! bounded wait parks a deadline here.
//!
//! Design:
//! - min-heap of (deadline, timer id) entries
//! - cancellation is lazy: cancelled entries are skipped on expiry
//! - `expire(now)` returns the threads whose deadline passed

use super::thread::ThreadId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Unique identifier for a pending timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// A relative wait bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never block: fail immediately if the condition does not hold
    None,
    /// Block for at most this many ticks from now
    Ticks(u64),
    /// Block until the condition holds, however long that takes
    Forever,
}

impl Timeout {
    /// True for bounds that never allow blocking. `Ticks(0)` is a zero
    /// deadline that has already elapsed, so it behaves like `None`.
    pub fn is_immediate(self) -> bool {
        matches!(self, Timeout::None | Timeout::Ticks(0))
    }
}

/// Entry in the timeout heap (for ordering)
#[derive(Debug)]
struct TimeoutEntry {
    deadline: u64,
    id: TimerId,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimeoutEntry {}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap (earliest deadline first);
        // ties broken by id so expiry order is deterministic.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.id.0.cmp(&self.id.0))
    }
}

/// All pending deadlines, one per blocked-with-timeout thread
#[derive(Debug, Default)]
pub struct TimeoutQueue {
    heap: BinaryHeap<TimeoutEntry>,
    /// Timers still pending; cancel() removes from here only
    pending: HashMap<TimerId, ThreadId>,
    next_id: u64,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 1,
        }
    }

    /// Park a deadline for a thread
    pub fn schedule(&mut self, deadline: u64, thread: ThreadId) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(TimeoutEntry { deadline, id });
        self.pending.insert(id, thread);
        id
    }

    /// Cancel a pending deadline (the wait completed some other way).
    /// Returns true if the timer was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Pop every deadline at or before `now`, returning the threads to
    /// wake. Cancelled entries are dropped silently.
    pub fn expire(&mut self, now: u64) -> Vec<ThreadId> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = match self.heap.pop() {
                Some(e) => e,
                None => break,
            };
            if let Some(thread) = self.pending.remove(&entry.id) {
                expired.push(thread);
            }
        }
        expired
    }

    /// Earliest pending deadline (for idle embedders)
    pub fn next_deadline(&self) -> Option<u64> {
        // The heap top may be a cancelled entry; scan the pending set
        // instead of mutating here.
        self.heap
            .iter()
            .filter(|e| self.pending.contains_key(&e.id))
            .map(|e| e.deadline)
            .min()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
