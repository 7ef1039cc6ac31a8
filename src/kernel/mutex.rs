//! Recursive mutexes with priority inheritance
//!
//! Ownership is by thread id and re-entrant up to a per-mutex recursion
//! limit. While a more urgent thread waits, the owner runs at the
//! waiter's priority; the boost is transitive across a chain of owners
//! (see `Kernel::refresh_priority_chain`) and decays as soon as the
//! waiter leaves, whichever way it leaves.
//!
//! Unlock hands the mutex directly to the most urgent waiter. There is
//! no window where the mutex is free while threads still wait, so a
//! late-arriving urgent thread cannot barge ahead of a queued one.

use super::error::{KernelError, KernelResult};
use super::scheduler::{Blocking, Kernel, Wait, WaitOutcome};
use super::thread::ThreadId;
use super::timer::Timeout;
use super::waitqueue::WaitQueue;

/// Mutex identifier (index into the kernel's mutex table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(pub usize);

impl std::fmt::Display for MutexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mutex:{}", self.0)
    }
}

/// Mutex state, owned by the kernel table
pub(crate) struct KernelMutex {
    pub(crate) owner: Option<ThreadId>,
    /// Recursive lock depth; 0 iff unowned
    pub(crate) depth: u32,
    pub(crate) max_recursion: u32,
    pub(crate) waiters: WaitQueue,
    /// Threads with a poll registration for `MUTEX_FREE`
    pub(crate) pollers: Vec<ThreadId>,
}

impl Kernel {
    /// Create a mutex. `max_recursion` is the lock-depth cap; 1 means
    /// non-recursive.
    pub fn mutex_create(&mut self, max_recursion: u32) -> KernelResult<MutexId> {
        if max_recursion == 0 {
            return Err(KernelError::InvalidArgument("max_recursion must be >= 1"));
        }
        let id = MutexId(self.mutexes.insert(KernelMutex {
            owner: None,
            depth: 0,
            max_recursion,
            waiters: WaitQueue::new(),
            pollers: Vec::new(),
        }));
        log::debug!("[mutex] created {id}");
        Ok(id)
    }

    /// Lock `mid` on behalf of the current thread.
    pub fn mutex_lock(&mut self, mid: MutexId, timeout: Timeout) -> KernelResult<Blocking<()>> {
        let caller = self.running_thread()?;
        let mx = self.mutexes.get_mut(mid.0).ok_or(KernelError::NotFound)?;

        match mx.owner {
            None => {
                mx.owner = Some(caller);
                mx.depth = 1;
                self.threads[caller.0].held_mutexes.push(mid);
                log::trace!("[mutex] {mid} acquired by {caller}");
                Ok(Blocking::Completed(()))
            }
            Some(owner) if owner == caller => {
                if mx.depth >= mx.max_recursion {
                    return Err(KernelError::InvalidState);
                }
                mx.depth += 1;
                Ok(Blocking::Completed(()))
            }
            Some(owner) => {
                if timeout.is_immediate() {
                    return Err(KernelError::Timeout);
                }
                let (priority, seq) = self.block_running(caller, Wait::Mutex(mid), timeout);
                self.mutexes[mid.0].waiters.insert(caller, priority, seq);
                log::trace!("[mutex] {caller} blocks on {mid} held by {owner}");
                // The new waiter may boost the owner (and its owners)
                self.refresh_priority_chain(owner);
                self.reschedule();
                Ok(Blocking::Blocked)
            }
        }
    }

    /// Unlock `mid`. Only the owner may unlock; the outermost unlock
    /// hands ownership straight to the most urgent waiter.
    pub fn mutex_unlock(&mut self, mid: MutexId) -> KernelResult<()> {
        let caller = self.running_thread()?;
        let mx = self.mutexes.get_mut(mid.0).ok_or(KernelError::NotFound)?;

        if mx.owner != Some(caller) {
            return Err(KernelError::InvalidState);
        }
        if mx.depth > 1 {
            mx.depth -= 1;
            return Ok(());
        }

        self.threads[caller.0]
            .held_mutexes
            .retain(|m| *m != mid);
        self.transfer_or_release(mid);
        // Dropping the mutex may end the caller's boost
        self.refresh_priority_chain(caller);
        self.reschedule();
        Ok(())
    }

    /// Hand the mutex to the most urgent waiter, or mark it free and
    /// notify pollers.
    fn transfer_or_release(&mut self, mid: MutexId) {
        let mx = &mut self.mutexes[mid.0];
        match mx.waiters.pop_front() {
            Some(next) => {
                mx.owner = Some(next);
                mx.depth = 1;
                self.threads[next.0].held_mutexes.push(mid);
                self.wake(next, WaitOutcome::Locked);
                log::trace!("[mutex] {mid} handed to {next}");
                // The new owner may itself deserve a boost from the
                // waiters still queued.
                self.refresh_priority_chain(next);
            }
            None => {
                mx.owner = None;
                mx.depth = 0;
                self.poll_notify_mutex(mid);
            }
        }
    }

    /// Abort path: strip ownership from a dying thread. The next waiter
    /// gets the mutex even though the protected state may be
    /// inconsistent; that hazard is the price of abort.
    pub(crate) fn mutex_force_release(&mut self, mid: MutexId) {
        let Some(mx) = self.mutexes.get_mut(mid.0) else {
            return;
        };
        log::warn!("[mutex] {mid} force-released by abort");
        mx.owner = None;
        mx.depth = 0;
        self.transfer_or_release(mid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::scheduler::ThreadSpec;
    use crate::kernel::thread::{Priority, StackRegion, ThreadState};

    fn entry(_: usize, _: usize, _: usize) {}

    fn spawn(k: &mut Kernel, name: &str, priority: u8) -> ThreadId {
        k.thread_create(ThreadSpec::new(
            name,
            entry,
            Priority(priority),
            StackRegion::new(0x2000_0000, 4096),
        ))
        .unwrap()
    }

    #[test]
    fn test_uncontended_lock_unlock() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let m = k.mutex_create(1).unwrap();

        assert_eq!(k.mutex_lock(m, Timeout::Forever).unwrap(), Blocking::Completed(()));
        assert!(k.thread(a).unwrap().held_mutexes.contains(&m));
        k.mutex_unlock(m).unwrap();
        assert!(k.thread(a).unwrap().held_mutexes.is_empty());
    }

    #[test]
    fn test_recursion_limit() {
        let mut k = Kernel::new();
        spawn(&mut k, "a", 5);
        let m = k.mutex_create(2).unwrap();

        k.mutex_lock(m, Timeout::Forever).unwrap();
        k.mutex_lock(m, Timeout::Forever).unwrap();
        assert_eq!(k.mutex_lock(m, Timeout::Forever), Err(KernelError::InvalidState));

        // Inner unlock keeps ownership, outer releases
        k.mutex_unlock(m).unwrap();
        k.mutex_unlock(m).unwrap();
        assert_eq!(k.mutex_unlock(m), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_non_owner_unlock_rejected() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let m = k.mutex_create(1).unwrap();
        k.mutex_lock(m, Timeout::Forever).unwrap();

        // b preempts a and tries to unlock a's mutex
        let b = spawn(&mut k, "b", 2);
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.mutex_unlock(m), Err(KernelError::InvalidState));
        let _ = a;
    }

    #[test]
    fn test_direct_handoff_to_most_urgent_waiter() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let m = k.mutex_create(1).unwrap();
        k.mutex_lock(m, Timeout::Forever).unwrap();

        let b = spawn(&mut k, "b", 2);
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.mutex_lock(m, Timeout::Forever).unwrap(), Blocking::Blocked);
        // b blocked, a boosted and running again
        assert_eq!(k.current(), Some(a));

        k.mutex_unlock(m).unwrap();
        // b owns the mutex now and preempts a
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.take_outcome(b), Some(WaitOutcome::Locked));
        assert!(k.thread(b).unwrap().held_mutexes.contains(&m));
    }

    #[test]
    fn test_priority_inheritance_boost_and_decay() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let m = k.mutex_create(1).unwrap();
        k.mutex_lock(m, Timeout::Forever).unwrap();

        let _b = spawn(&mut k, "b", 2);
        k.mutex_lock(m, Timeout::Forever).unwrap();

        // a inherits b's priority while b waits
        assert_eq!(k.effective_priority(a).unwrap(), Priority(2));
        assert_eq!(k.base_priority(a).unwrap(), Priority(5));
        assert!(k.thread(a).unwrap().is_boosted());

        k.mutex_unlock(m).unwrap();
        // Boost decays the moment the wait ends
        assert_eq!(k.effective_priority(a).unwrap(), Priority(5));
        assert!(!k.thread(a).unwrap().is_boosted());
    }

    #[test]
    fn test_boost_decays_on_waiter_timeout() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let m = k.mutex_create(1).unwrap();
        k.mutex_lock(m, Timeout::Forever).unwrap();

        let b = spawn(&mut k, "b", 2);
        k.mutex_lock(m, Timeout::Ticks(3)).unwrap();
        assert_eq!(k.effective_priority(a).unwrap(), Priority(2));

        for _ in 0..3 {
            k.tick();
        }
        assert_eq!(k.take_outcome(b), Some(WaitOutcome::TimedOut));
        assert_eq!(k.effective_priority(a).unwrap(), Priority(5));
        // a still owns the mutex
        assert!(k.thread(a).unwrap().held_mutexes.contains(&m));
    }

    #[test]
    fn test_transitive_inheritance_chain() {
        let mut k = Kernel::new();
        // c (low) owns m1; b (mid) owns m2 and blocks on m1;
        // a (high) blocks on m2. Both b and c must end up at a's level.
        let c = spawn(&mut k, "c", 9);
        let m1 = k.mutex_create(1).unwrap();
        k.mutex_lock(m1, Timeout::Forever).unwrap();

        let b = spawn(&mut k, "b", 6);
        let m2 = k.mutex_create(1).unwrap();
        k.mutex_lock(m2, Timeout::Forever).unwrap();
        k.mutex_lock(m1, Timeout::Forever).unwrap(); // b blocks, c boosted to 6
        assert_eq!(k.effective_priority(c).unwrap(), Priority(6));

        let a = spawn(&mut k, "a", 1);
        k.mutex_lock(m2, Timeout::Forever).unwrap(); // a blocks on b's mutex
        assert_eq!(k.effective_priority(b).unwrap(), Priority(1));
        assert_eq!(k.effective_priority(c).unwrap(), Priority(1));
        let _ = a;
    }

    #[test]
    fn test_immediate_lock_on_contended() {
        let mut k = Kernel::new();
        spawn(&mut k, "a", 5);
        let m = k.mutex_create(1).unwrap();
        k.mutex_lock(m, Timeout::Forever).unwrap();

        spawn(&mut k, "b", 2);
        assert_eq!(k.mutex_lock(m, Timeout::None), Err(KernelError::Timeout));
        assert_eq!(k.mutex_lock(m, Timeout::Ticks(0)), Err(KernelError::Timeout));
    }

    #[test]
    fn test_abort_owner_hands_off() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let m = k.mutex_create(1).unwrap();
        k.mutex_lock(m, Timeout::Forever).unwrap();

        let b = spawn(&mut k, "b", 2);
        k.mutex_lock(m, Timeout::Forever).unwrap();
        assert_eq!(k.current(), Some(a));

        k.abort(a).unwrap();
        // b inherits ownership and runs
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.take_outcome(b), Some(WaitOutcome::Locked));
        assert_eq!(k.thread_state(a).unwrap(), ThreadState::Dead);
    }
}
