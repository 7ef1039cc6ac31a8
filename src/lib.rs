//! kestrel - a deterministic priority-preemptive kernel core
//!
//! The executable core of a small RTOS, hosted: fixed-priority
//! preemptive scheduling with FIFO fairness among equals, recursive
//! mutexes with transitive priority inheritance, counting semaphores
//! with direct hand-off, bounded message queues, multi-object poll,
//! and tick-based timeouts.
//!
//! The crate deliberately stops at the scheduler boundary. Context
//! switching, stack allocation and the timer interrupt belong to an
//! external dispatch layer; the core tells it what to run and it tells
//! the core when time passes. That split is what makes every scheduling
//! decision deterministic and unit-testable.
//!
//! ```
//! use kestrel::kernel::{Kernel, Priority, StackRegion, ThreadSpec};
//!
//! fn entry(_: usize, _: usize, _: usize) {}
//!
//! let mut k = Kernel::new();
//! let spec = ThreadSpec::new("worker", entry, Priority(4), StackRegion::new(0x2000_0000, 4096));
//! let worker = k.thread_create(spec).unwrap();
//! assert_eq!(k.current(), Some(worker));
//! ```

pub mod kernel;
