//! Ready queue
//!
//! The set of runnable threads, ordered by (effective priority, enqueue
//! seq). Structurally this is just a wait queue whose resource is the
//! CPU, so it delegates to `WaitQueue` and adds the scheduling-facing
//! vocabulary on top.

use super::thread::{Priority, ThreadId};
use super::waitqueue::WaitQueue;

/// Priority-ordered queue of Ready threads
#[derive(Debug, Default)]
pub struct ReadyQueue {
    queue: WaitQueue,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self { queue: WaitQueue::new() }
    }

    /// Enqueue a runnable thread
    pub fn push(&mut self, thread: ThreadId, priority: Priority, seq: u64) {
        self.queue.insert(thread, priority, seq);
    }

    /// The best candidate to run next, without dequeuing
    pub fn peek(&self) -> Option<(ThreadId, Priority)> {
        self.queue.peek()
    }

    /// Dequeue the best candidate
    pub fn pop(&mut self) -> Option<ThreadId> {
        self.queue.pop_front()
    }

    /// Drop a thread that is no longer runnable
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        self.queue.remove(thread)
    }

    /// Reorder after a priority change (enqueue seq is preserved)
    pub fn reprioritize(&mut self, thread: ThreadId, priority: Priority) -> bool {
        self.queue.reprioritize(thread, priority)
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.queue.contains(thread)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
