//! Wait queues
//!
//! A wait queue is the ordered list of threads blocked on one
//! synchronization object: most urgent priority first, FIFO by block
//! time among equals. The sequence number is frozen when the thread
//! blocks; a priority change reorders the entry but keeps its seq, so
//! FIFO fairness among the new peers is preserved.

use super::thread::{Priority, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Waiter {
    priority: Priority,
    seq: u64,
    thread: ThreadId,
}

impl Waiter {
    fn key(&self) -> (Priority, u64) {
        (self.priority, self.seq)
    }
}

/// Priority-ordered queue of blocked threads
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: Vec<Waiter>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self { waiters: Vec::new() }
    }

    /// Insert a thread, keeping (priority, seq) order
    pub fn insert(&mut self, thread: ThreadId, priority: Priority, seq: u64) {
        let waiter = Waiter { priority, seq, thread };
        let at = self
            .waiters
            .iter()
            .position(|w| w.key() > waiter.key())
            .unwrap_or(self.waiters.len());
        self.waiters.insert(at, waiter);
    }

    /// Remove and return the most urgent waiter
    pub fn pop_front(&mut self) -> Option<ThreadId> {
        if self.waiters.is_empty() {
            None
        } else {
            Some(self.waiters.remove(0).thread)
        }
    }

    /// Most urgent waiter without removing it
    pub fn peek(&self) -> Option<(ThreadId, Priority)> {
        self.waiters.first().map(|w| (w.thread, w.priority))
    }

    /// Priority of the most urgent waiter, if any
    pub fn highest_priority(&self) -> Option<Priority> {
        self.waiters.first().map(|w| w.priority)
    }

    /// Remove a specific thread. Returns true if it was queued here.
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        match self.waiters.iter().position(|w| w.thread == thread) {
            Some(at) => {
                self.waiters.remove(at);
                true
            }
            None => false,
        }
    }

    /// Reorder one entry after a priority change, keeping its seq
    pub fn reprioritize(&mut self, thread: ThreadId, priority: Priority) -> bool {
        let Some(at) = self.waiters.iter().position(|w| w.thread == thread) else {
            return false;
        };
        let mut waiter = self.waiters.remove(at);
        waiter.priority = priority;
        let at = self
            .waiters
            .iter()
            .position(|w| w.key() > waiter.key())
            .unwrap_or(self.waiters.len());
        self.waiters.insert(at, waiter);
        true
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.waiters.iter().any(|w| w.thread == thread)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
