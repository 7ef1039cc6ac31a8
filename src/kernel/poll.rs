//! Multi-object wait
//!
//! `poll_wait` blocks the current thread on a set of (object, interest)
//! pairs until any of them is satisfied. Registration is level-style:
//! readiness is re-checked against live object state at wake time, so a
//! condition that appears and disappears while the poller is queued
//! behind a reschedule is never falsely reported.
//!
//! Poll observes, it never consumes: a reported `SEM_AVAILABLE` is an
//! invitation to call `sem_take`, not a taken unit.

use bitflags::bitflags;

use super::error::{KernelError, KernelResult};
use super::msgqueue::QueueId;
use super::mutex::MutexId;
use super::scheduler::{Blocking, Kernel, Wait, WaitOutcome};
use super::semaphore::SemId;
use super::thread::ThreadId;
use super::timer::Timeout;

bitflags! {
    /// What about a target the poller cares about
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollInterest: u8 {
        /// Semaphore count is above zero
        const SEM_AVAILABLE   = 1 << 0;
        /// Message queue holds at least one message
        const QUEUE_NON_EMPTY = 1 << 1;
        /// Message queue has at least one free slot
        const QUEUE_NOT_FULL  = 1 << 2;
        /// Mutex is unowned
        const MUTEX_FREE      = 1 << 3;
    }
}

/// An object a poll event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTarget {
    Semaphore(SemId),
    Queue(QueueId),
    Mutex(MutexId),
}

/// One (target, interest) pair in a poll set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub target: PollTarget,
    pub interest: PollInterest,
}

impl PollEvent {
    pub fn sem_available(sid: SemId) -> Self {
        Self { target: PollTarget::Semaphore(sid), interest: PollInterest::SEM_AVAILABLE }
    }

    pub fn queue_non_empty(qid: QueueId) -> Self {
        Self { target: PollTarget::Queue(qid), interest: PollInterest::QUEUE_NON_EMPTY }
    }

    pub fn queue_not_full(qid: QueueId) -> Self {
        Self { target: PollTarget::Queue(qid), interest: PollInterest::QUEUE_NOT_FULL }
    }

    pub fn mutex_free(mid: MutexId) -> Self {
        Self { target: PollTarget::Mutex(mid), interest: PollInterest::MUTEX_FREE }
    }
}

impl Kernel {
    /// Block the current thread until any event in `events` is
    /// satisfied. Completes immediately with the indices of the
    /// already-satisfied events if there are any.
    pub fn poll_wait(
        &mut self,
        events: Vec<PollEvent>,
        timeout: Timeout,
    ) -> KernelResult<Blocking<Vec<usize>>> {
        let caller = self.running_thread()?;
        if events.is_empty() {
            return Err(KernelError::InvalidArgument("empty poll set"));
        }
        for ev in &events {
            self.poll_validate(ev)?;
        }

        let hits = self.poll_satisfied(&events);
        if !hits.is_empty() {
            return Ok(Blocking::Completed(hits));
        }
        if timeout.is_immediate() {
            return Err(KernelError::Timeout);
        }

        for ev in &events {
            self.poll_register(caller, ev);
        }
        self.block_running(caller, Wait::Poll(events), timeout);
        log::trace!("[poll] {caller} blocks on poll set");
        self.reschedule();
        Ok(Blocking::Blocked)
    }

    /// Indices of the satisfied events, in poll-set order
    pub fn poll_satisfied(&self, events: &[PollEvent]) -> Vec<usize> {
        events
            .iter()
            .enumerate()
            .filter(|(_, ev)| self.poll_condition(ev))
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether one event's condition currently holds. Read-only.
    pub fn poll_condition(&self, ev: &PollEvent) -> bool {
        match ev.target {
            PollTarget::Semaphore(sid) => {
                let Some(sem) = self.semaphores.get(sid.0) else {
                    return false;
                };
                ev.interest.contains(PollInterest::SEM_AVAILABLE) && sem.count > 0
            }
            PollTarget::Queue(qid) => {
                let Some(q) = self.queues.get(qid.0) else {
                    return false;
                };
                (ev.interest.contains(PollInterest::QUEUE_NON_EMPTY) && !q.is_empty())
                    || (ev.interest.contains(PollInterest::QUEUE_NOT_FULL) && !q.is_full())
            }
            PollTarget::Mutex(mid) => {
                let Some(mx) = self.mutexes.get(mid.0) else {
                    return false;
                };
                ev.interest.contains(PollInterest::MUTEX_FREE) && mx.owner.is_none()
            }
        }
    }

    fn poll_validate(&self, ev: &PollEvent) -> KernelResult<()> {
        let known = match ev.target {
            PollTarget::Semaphore(sid) => self.semaphores.contains(sid.0),
            PollTarget::Queue(qid) => self.queues.contains(qid.0),
            PollTarget::Mutex(mid) => self.mutexes.contains(mid.0),
        };
        if known { Ok(()) } else { Err(KernelError::NotFound) }
    }

    fn poll_register(&mut self, id: ThreadId, ev: &PollEvent) {
        let pollers = match ev.target {
            PollTarget::Semaphore(sid) => &mut self.semaphores[sid.0].pollers,
            PollTarget::Queue(qid) => &mut self.queues[qid.0].pollers,
            PollTarget::Mutex(mid) => &mut self.mutexes[mid.0].pollers,
        };
        if !pollers.contains(&id) {
            pollers.push(id);
        }
    }

    /// Drop every registration a poll set created (wake, timeout and
    /// abort paths all come through here).
    pub(crate) fn poll_deregister(&mut self, id: ThreadId, events: &[PollEvent]) {
        for ev in events {
            match ev.target {
                PollTarget::Semaphore(sid) => {
                    if let Some(sem) = self.semaphores.get_mut(sid.0) {
                        sem.pollers.retain(|p| *p != id);
                    }
                }
                PollTarget::Queue(qid) => {
                    if let Some(q) = self.queues.get_mut(qid.0) {
                        q.pollers.retain(|p| *p != id);
                    }
                }
                PollTarget::Mutex(mid) => {
                    if let Some(mx) = self.mutexes.get_mut(mid.0) {
                        mx.pollers.retain(|p| *p != id);
                    }
                }
            }
        }
    }

    pub(crate) fn poll_notify_sem(&mut self, sid: SemId) {
        let pollers = self.semaphores[sid.0].pollers.clone();
        self.poll_recheck(pollers);
    }

    pub(crate) fn poll_notify_queue(&mut self, qid: QueueId) {
        let pollers = self.queues[qid.0].pollers.clone();
        self.poll_recheck(pollers);
    }

    pub(crate) fn poll_notify_mutex(&mut self, mid: MutexId) {
        let pollers = self.mutexes[mid.0].pollers.clone();
        self.poll_recheck(pollers);
    }

    /// Re-evaluate each notified poller's whole set against live state;
    /// wake the ones with at least one hit.
    fn poll_recheck(&mut self, pollers: Vec<ThreadId>) {
        for id in pollers {
            let Some(th) = self.threads.get(id.0) else {
                continue;
            };
            let Some(Wait::Poll(events)) = th.wait.clone() else {
                continue;
            };
            let hits = self.poll_satisfied(&events);
            if hits.is_empty() {
                continue;
            }
            self.poll_deregister(id, &events);
            self.wake(id, WaitOutcome::Poll(hits));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::scheduler::ThreadSpec;
    use crate::kernel::semaphore::SemLimitPolicy;
    use crate::kernel::thread::{Priority, StackRegion};

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
    fn test_immediate_completion_reports_all_hits() {
        let mut k = Kernel::new();
        spawn(&mut k, "a", 5);
        let s = k.sem_create(1, 1, SemLimitPolicy::Saturate).unwrap();
        let q = k.msgq_create(1, 1).unwrap();

        let events = vec![
            PollEvent::sem_available(s),
            PollEvent::queue_non_empty(q),
            PollEvent::queue_not_full(q),
        ];
        // Sem has a unit, queue is empty but not full: hits 0 and 2
        let hits = k.poll_wait(events, Timeout::Forever).unwrap().completed().unwrap();
        assert_eq!(hits, vec![0, 2]);
    }

    #[test]
    fn test_empty_set_rejected() {
        let mut k = Kernel::new();
        spawn(&mut k, "a", 5);
        assert!(matches!(
            k.poll_wait(vec![], Timeout::Forever),
            Err(KernelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let mut k = Kernel::new();
        spawn(&mut k, "a", 5);
        assert_eq!(
            k.poll_wait(vec![PollEvent::sem_available(SemId(9))], Timeout::Forever),
            Err(KernelError::NotFound)
        );
    }

    #[test]
    fn test_wakes_on_any_target() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let s = k.sem_create(0, 1, SemLimitPolicy::Saturate).unwrap();
        let q = k.msgq_create(1, 1).unwrap();

        let events = vec![PollEvent::sem_available(s), PollEvent::queue_non_empty(q)];
        assert_eq!(k.poll_wait(events, Timeout::Forever).unwrap(), Blocking::Blocked);

        // A give satisfies the first event
        k.sem_give(s).unwrap();
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.take_outcome(a), Some(WaitOutcome::Poll(vec![0])));

        // All registrations are gone; further traffic wakes nobody
        k.sem_take(s, Timeout::None).unwrap();
        k.msgq_put(q, &[1], Timeout::None).unwrap();
        assert_eq!(k.take_outcome(a), None);
    }

    #[test]
    fn test_poll_does_not_consume() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let s = k.sem_create(0, 1, SemLimitPolicy::Saturate).unwrap();

        k.poll_wait(vec![PollEvent::sem_available(s)], Timeout::Forever).unwrap();
        k.sem_give(s).unwrap();
        assert_eq!(k.take_outcome(a), Some(WaitOutcome::Poll(vec![0])));
        // The unit is still there for an explicit take
        assert_eq!(k.sem_count(s).unwrap(), 1);
        assert_eq!(k.sem_take(s, Timeout::None).unwrap(), Blocking::Completed(()));
    }

    #[test]
    fn test_poll_timeout_clears_registrations() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let s = k.sem_create(0, 1, SemLimitPolicy::Saturate).unwrap();

        k.poll_wait(vec![PollEvent::sem_available(s)], Timeout::Ticks(2)).unwrap();
        k.tick();
        k.tick();
        assert_eq!(k.take_outcome(a), Some(WaitOutcome::TimedOut));

        // No stale registration left behind
        k.sem_give(s).unwrap();
        assert_eq!(k.take_outcome(a), None);
        assert_eq!(k.sem_count(s).unwrap(), 1);
    }

    #[test]
    fn test_mutex_free_interest() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let m = k.mutex_create(1).unwrap();
        k.mutex_lock(m, Timeout::Forever).unwrap();

        let b = spawn(&mut k, "b", 7);
        // Park a on a sleep so the less urgent b gets to run and poll
        k.sleep(10).unwrap();
        assert_eq!(k.current(), Some(b));
        k.poll_wait(vec![PollEvent::mutex_free(m)], Timeout::Forever).unwrap();

        // Nothing runnable until a wakes and unlocks
        for _ in 0..10 {
            k.tick();
        }
        assert_eq!(k.current(), Some(a));
        k.mutex_unlock(m).unwrap();
        assert_eq!(k.take_outcome(b), Some(WaitOutcome::Poll(vec![0])));
    }

    #[test]
    fn test_multiple_pollers_all_woken() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        let s = k.sem_create(0, 2, SemLimitPolicy::Saturate).unwrap();

        k.poll_wait(vec![PollEvent::sem_available(s)], Timeout::Forever).unwrap();
        k.poll_wait(vec![PollEvent::sem_available(s)], Timeout::Forever).unwrap();

        // Level semantics: one give satisfies both observers
        k.sem_give(s).unwrap();
        assert_eq!(k.take_outcome(a), Some(WaitOutcome::Poll(vec![0])));
        assert_eq!(k.take_outcome(b), Some(WaitOutcome::Poll(vec![0])));
    }
}
