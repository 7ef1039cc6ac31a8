//! Counting semaphores
//!
//! A semaphore is a counter in `0..=max`. `give` may be called with no
//! current thread, so an interrupt layer can signal from outside any
//! thread context. When a taker is queued, a give passes the unit to it
//! directly; the count never moves, so there is no window where a
//! late-arriving taker can steal the unit from a queued one.

use super::error::{KernelError, KernelResult};
use super::scheduler::{Blocking, Kernel, Wait, WaitOutcome};
use super::thread::ThreadId;
use super::timer::Timeout;
use super::waitqueue::WaitQueue;

/// Semaphore identifier (index into the kernel's semaphore table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemId(pub usize);

impl std::fmt::Display for SemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sem:{}", self.0)
    }
}

/// What a give at `count == max` does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SemLimitPolicy {
    /// The give is accepted but the count stays at max
    #[default]
    Saturate,
    /// The give fails with `CapacityExceeded`
    Strict,
}

/// Semaphore state, owned by the kernel table
pub(crate) struct KernelSemaphore {
    pub(crate) count: u32,
    pub(crate) max: u32,
    pub(crate) policy: SemLimitPolicy,
    pub(crate) waiters: WaitQueue,
    /// Threads with a poll registration for `SEM_AVAILABLE`
    pub(crate) pollers: Vec<ThreadId>,
}

impl Kernel {
    pub fn sem_create(
        &mut self,
        initial: u32,
        max: u32,
        policy: SemLimitPolicy,
    ) -> KernelResult<SemId> {
        if max == 0 {
            return Err(KernelError::InvalidArgument("max must be >= 1"));
        }
        if initial > max {
            return Err(KernelError::InvalidArgument("initial exceeds max"));
        }
        let id = SemId(self.semaphores.insert(KernelSemaphore {
            count: initial,
            max,
            policy,
            waiters: WaitQueue::new(),
            pollers: Vec::new(),
        }));
        log::debug!("[sem] created {id} ({initial}/{max})");
        Ok(id)
    }

    /// Release one unit. Callable with no current thread (interrupt
    /// context); if that wakes a more urgent thread it runs immediately.
    pub fn sem_give(&mut self, sid: SemId) -> KernelResult<()> {
        let sem = self.semaphores.get_mut(sid.0).ok_or(KernelError::NotFound)?;
        match sem.waiters.pop_front() {
            Some(taker) => {
                // Direct hand-off, count unchanged
                self.wake(taker, WaitOutcome::Taken);
                log::trace!("[sem] {sid} unit handed to {taker}");
            }
            None if sem.count < sem.max => {
                sem.count += 1;
                self.poll_notify_sem(sid);
            }
            None => match sem.policy {
                SemLimitPolicy::Saturate => {}
                SemLimitPolicy::Strict => return Err(KernelError::CapacityExceeded),
            },
        }
        self.reschedule();
        Ok(())
    }

    /// Take one unit on behalf of the current thread.
    pub fn sem_take(&mut self, sid: SemId, timeout: Timeout) -> KernelResult<Blocking<()>> {
        let caller = self.running_thread()?;
        let sem = self.semaphores.get_mut(sid.0).ok_or(KernelError::NotFound)?;

        if sem.count > 0 {
            sem.count -= 1;
            return Ok(Blocking::Completed(()));
        }
        if timeout.is_immediate() {
            return Err(KernelError::Timeout);
        }
        let (priority, seq) = self.block_running(caller, Wait::Semaphore(sid), timeout);
        self.semaphores[sid.0].waiters.insert(caller, priority, seq);
        log::trace!("[sem] {caller} blocks on {sid}");
        self.reschedule();
        Ok(Blocking::Blocked)
    }

    /// Current count (diagnostic)
    pub fn sem_count(&self, sid: SemId) -> KernelResult<u32> {
        Ok(self.semaphores.get(sid.0).ok_or(KernelError::NotFound)?.count)
    }
}
