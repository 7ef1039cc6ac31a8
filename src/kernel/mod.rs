//! The kernel core - scheduling, synchronization, and time
//!
//! Single-core, deterministic, hosted: the kernel is a state machine
//! driven entirely by its operations and `tick()`. Given the same call
//! sequence it makes the same decisions, which is what makes the
//! scheduling and inheritance behavior testable.

pub mod error;
pub mod msgqueue;
pub mod mutex;
pub mod poll;
pub mod readyqueue;
pub mod scheduler;
pub mod semaphore;
pub mod thread;
pub mod timer;
pub mod waitqueue;


pub use error::{KernelError, KernelResult};
pub use msgqueue::QueueId;
pub use mutex::MutexId;
pub use poll::{PollEvent, PollInterest, PollTarget};
pub use scheduler::{Blocking, Kernel, ThreadSpec, WaitOutcome, PI_CHAIN_MAX};
pub use semaphore::{SemId, SemLimitPolicy};
pub use thread::{
    EntryFn, Priority, StackRegion, ThreadId, ThreadState, PRIORITY_LEVELS,
};
pub use timer::Timeout;

use std::cell::RefCell;

thread_local! {
    /// The global kernel instance
    static KERNEL: RefCell<Kernel> = RefCell::new(Kernel::new());
}

/// Run a closure against the global kernel instance
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    KERNEL.with(|k| f(&mut k.borrow_mut()))
}

/// Create a thread on the global kernel
pub fn spawn(spec: ThreadSpec) -> KernelResult<ThreadId> {
    with_kernel(|k| k.thread_create(spec))
}

/// Advance the global kernel's clock by one tick
pub fn tick() {
    with_kernel(|k| k.tick())
}

/// The global kernel's current tick count
pub fn now() -> u64 {
    with_kernel(|k| k.now())
}
