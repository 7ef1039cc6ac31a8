//! Thread control blocks
//!
//! A thread is the unit of execution. The kernel owns one control block
//! per thread; everything else (ready queue, wait queues, timeout queue)
//! refers to threads by id. Exactly one thread is Running at a time -
//! this is a single-core model.

use super::error::{KernelError, KernelResult};
use super::mutex::MutexId;
use super::scheduler::{Wait, WaitOutcome};
use super::timer::TimerId;

/// Number of distinct priority levels (0..PRIORITY_LEVELS)
pub const PRIORITY_LEVELS: u8 = 32;

/// Thread priority. Lower numeric value = more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Most urgent level
    pub const HIGHEST: Priority = Priority(0);
    /// Least urgent level
    pub const LOWEST: Priority = Priority(PRIORITY_LEVELS - 1);

    /// Validated constructor
    pub fn new(level: u8) -> KernelResult<Self> {
        if level < PRIORITY_LEVELS {
            Ok(Priority(level))
        } else {
            Err(KernelError::InvalidArgument("priority out of range"))
        }
    }

    pub fn is_valid(self) -> bool {
        self.0 < PRIORITY_LEVELS
    }

    /// True if `self` preempts `other`
    pub fn is_more_urgent_than(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "prio:{}", self.0)
    }
}

/// Thread identifier (index into the kernel's thread table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub usize);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread:{}", self.0)
    }
}

/// Thread execution state
///
/// The transition table is total: `Dead` is terminal, everything else is
/// reachable only through the scheduler's operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable, sitting in the ready queue
    Ready,
    /// Occupying the (single) CPU
    Running,
    /// Waiting on a synchronization object or a timeout
    Blocked,
    /// Explicitly suspended; not runnable until resumed
    Suspended,
    /// Aborted. Terminal - no transition leaves Dead.
    Dead,
}

impl ThreadState {
    pub const fn is_runnable(self) -> bool {
        matches!(self, ThreadState::Ready | ThreadState::Running)
    }

    pub const fn is_dead(self) -> bool {
        matches!(self, ThreadState::Dead)
    }
}

/// Thread entry point: three opaque arguments, no return value.
/// The kernel stores it and hands it to the external dispatch layer;
/// a return from the entry is treated as an abort by that layer.
pub type EntryFn = fn(usize, usize, usize);

/// Handle to an externally allocated stack region.
///
/// The core never manages physical memory; it only owns the handle for
/// the thread's lifetime and releases it on abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub base: usize,
    pub size: usize,
}

impl StackRegion {
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }
}

/// A thread control block
pub struct Thread {
    /// Unique id, stable for the lifetime of the kernel
    pub id: ThreadId,
    /// Human-readable name (for logs and debugging)
    pub name: String,
    /// Priority assigned by create/priority_set
    pub(crate) base_priority: Priority,
    /// Base priority possibly boosted by priority inheritance
    pub(crate) effective_priority: Priority,
    /// Current state
    pub state: ThreadState,
    /// Entry function
    pub entry: EntryFn,
    /// Opaque entry arguments
    pub args: [usize; 3],
    /// Stack handle; taken back on abort
    pub(crate) stack: Option<StackRegion>,
    /// Enqueue sequence number - FIFO tie-break among equal priorities.
    /// Refreshed when the thread becomes runnable or yields, kept across
    /// preemption (preemption is not a new arrival).
    pub(crate) queue_seq: u64,
    /// What the thread is blocked on, if Blocked
    pub(crate) wait: Option<Wait>,
    /// Pending timeout for the current wait
    pub(crate) timer: Option<TimerId>,
    /// Outcome of the last completed wait, until collected
    pub(crate) outcome: Option<WaitOutcome>,
    /// Mutexes currently owned (the priority-inheritance ownership graph)
    pub(crate) held_mutexes: Vec<MutexId>,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        name: String,
        priority: Priority,
        entry: EntryFn,
        args: [usize; 3],
        stack: StackRegion,
    ) -> Self {
        Self {
            id,
            name,
            base_priority: priority,
            effective_priority: priority,
            state: ThreadState::Blocked,
            entry,
            args,
            stack: Some(stack),
            queue_seq: 0,
            wait: None,
            timer: None,
            outcome: None,
            held_mutexes: Vec::new(),
        }
    }

    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    pub fn effective_priority(&self) -> Priority {
        self.effective_priority
    }

    /// Stack handle, if still owned (None once aborted)
    pub fn stack(&self) -> Option<StackRegion> {
        self.stack
    }

    pub fn is_alive(&self) -> bool {
        !self.state.is_dead()
    }

    /// True while the thread holds a priority boost above its base
    pub fn is_boosted(&self) -> bool {
        self.effective_priority.is_more_urgent_than(self.base_priority)
    }
}
