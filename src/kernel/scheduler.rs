//! The scheduler
//!
//! `Kernel` is the single owned context for the whole core: thread
//! table, ready queue, tick clock, timeout queue and every
//! synchronization object live here, and every operation is a
//! `&mut self` method. That makes each operation an indivisible
//! critical section - the hosted equivalent of running with the
//! scheduler lock held / interrupts masked.
//!
//! Scheduling rule: always run the most urgent Ready thread; ties are
//! broken FIFO by enqueue time. Reschedule points are every operation
//! that changes ready-queue membership or priority order, and every
//! timer tick.
//!
//! Blocking protocol: operations that may suspend the caller
//! (`mutex_lock`, `sem_take`, `msgq_put`, `msgq_get`, `poll_wait`,
//! `sleep`) act on the *current* thread and return
//! `Blocking::Completed(..)` or `Blocking::Blocked`. When a pending
//! wait finishes - satisfied, timed out - the kernel parks a
//! `WaitOutcome` on the control block for the external dispatch layer
//! to collect with `take_outcome`.

use slab::Slab;

use super::error::{KernelError, KernelResult};
use super::msgqueue::{KernelMsgQueue, QueueId};
use super::mutex::{KernelMutex, MutexId};
use super::poll::PollEvent;
use super::readyqueue::ReadyQueue;
use super::semaphore::{KernelSemaphore, SemId};
use super::thread::{EntryFn, Priority, StackRegion, Thread, ThreadId, ThreadState};
use super::timer::{Timeout, TimeoutQueue};

/// Cap on priority-inheritance chain walks. A deeper chain means a
/// deeper nest of threads each blocked on a mutex the next one owns;
/// bounding the walk bounds scheduling latency.
pub const PI_CHAIN_MAX: usize = 8;

/// What a Blocked thread is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Wait {
    /// Delayed start: becomes Ready when the timer fires
    Start,
    /// Timeout-only wait, no object
    Sleep,
    /// Contending for a mutex
    Mutex(MutexId),
    /// Waiting for a semaphore unit
    Semaphore(SemId),
    /// Sender blocked on a full queue; the message travels with it
    QueuePut { queue: QueueId, msg: Vec<u8> },
    /// Receiver blocked on an empty queue
    QueueGet(QueueId),
    /// Registered on several objects at once
    Poll(Vec<PollEvent>),
}

/// How a completed wait ended, collected via `Kernel::take_outcome`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Mutex acquired; ownership was handed over directly on unlock
    Locked,
    /// Semaphore unit received; it passed directly from a give
    Taken,
    /// Blocked send completed; the message is in the queue (or handed
    /// straight to a receiver)
    Sent,
    /// Blocked receive completed with this message
    Received(Vec<u8>),
    /// Sleep finished
    Woken,
    /// Poll returned; indices of the satisfied events
    Poll(Vec<usize>),
    /// The wait's deadline elapsed before the condition held
    TimedOut,
}

/// Result of an operation that may suspend the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking<T> {
    /// Finished without blocking
    Completed(T),
    /// The calling thread is now Blocked; the result arrives later as a
    /// `WaitOutcome`
    Blocked,
}

impl<T> Blocking<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Blocking::Completed(v) => Some(v),
            Blocking::Blocked => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Blocking::Blocked)
    }
}

/// Everything needed to create a thread
pub struct ThreadSpec {
    pub name: String,
    pub entry: EntryFn,
    pub args: [usize; 3],
    pub priority: Priority,
    pub stack: StackRegion,
    /// Ticks to wait before the thread first becomes Ready
    pub start_delay: u64,
}

impl ThreadSpec {
    pub fn new(
        name: impl Into<String>,
        entry: EntryFn,
        priority: Priority,
        stack: StackRegion,
    ) -> Self {
        Self {
            name: name.into(),
            entry,
            args: [0; 3],
            priority,
            stack,
            start_delay: 0,
        }
    }

    pub fn with_args(mut self, args: [usize; 3]) -> Self {
        self.args = args;
        self
    }

    pub fn with_start_delay(mut self, ticks: u64) -> Self {
        self.start_delay = ticks;
        self
    }
}

/// The kernel context - all scheduler and synchronization state
pub struct Kernel {
    pub(crate) threads: Slab<Thread>,
    pub(crate) ready: ReadyQueue,
    pub(crate) current: Option<ThreadId>,
    pub(crate) now: u64,
    pub(crate) timeouts: TimeoutQueue,
    pub(crate) mutexes: Slab<KernelMutex>,
    pub(crate) semaphores: Slab<KernelSemaphore>,
    pub(crate) queues: Slab<KernelMsgQueue>,
    /// Monotonic enqueue counter, the FIFO tie-break
    seq: u64,
    context_switches: u64,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            threads: Slab::new(),
            ready: ReadyQueue::new(),
            current: None,
            now: 0,
            timeouts: TimeoutQueue::new(),
            mutexes: Slab::new(),
            semaphores: Slab::new(),
            queues: Slab::new(),
            seq: 0,
            context_switches: 0,
        }
    }

    /// Current tick count
    pub fn now(&self) -> u64 {
        self.now
    }

    /// The Running thread, if any
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    /// Total context switches performed
    pub fn context_switches(&self) -> u64 {
        self.context_switches
    }

    /// Borrow a control block
    pub fn thread(&self, id: ThreadId) -> KernelResult<&Thread> {
        self.threads.get(id.0).ok_or(KernelError::NotFound)
    }

    pub fn thread_state(&self, id: ThreadId) -> KernelResult<ThreadState> {
        Ok(self.thread(id)?.state)
    }

    pub fn base_priority(&self, id: ThreadId) -> KernelResult<Priority> {
        Ok(self.thread(id)?.base_priority)
    }

    pub fn effective_priority(&self, id: ThreadId) -> KernelResult<Priority> {
        Ok(self.thread(id)?.effective_priority)
    }

    /// Collect the outcome of a thread's last completed wait
    pub fn take_outcome(&mut self, id: ThreadId) -> Option<WaitOutcome> {
        self.threads.get_mut(id.0).and_then(|t| t.outcome.take())
    }

    // --- thread lifecycle -------------------------------------------------

    /// Create a thread. It becomes Ready immediately, or after
    /// `start_delay` ticks.
    pub fn thread_create(&mut self, spec: ThreadSpec) -> KernelResult<ThreadId> {
        if !spec.priority.is_valid() {
            return Err(KernelError::InvalidArgument("priority out of range"));
        }
        if spec.stack.size == 0 {
            return Err(KernelError::InvalidArgument("zero-sized stack"));
        }

        let entry = self.threads.vacant_entry();
        let id = ThreadId(entry.key());
        entry.insert(Thread::new(
            id,
            spec.name,
            spec.priority,
            spec.entry,
            spec.args,
            spec.stack,
        ));
        log::debug!(
            "[sched] created {} ({}, {})",
            self.threads[id.0].name,
            id,
            spec.priority
        );

        if spec.start_delay == 0 {
            self.make_ready(id);
        } else {
            let timer = self.timeouts.schedule(self.now + spec.start_delay, id);
            let th = &mut self.threads[id.0];
            th.wait = Some(Wait::Start);
            th.timer = Some(timer);
        }
        self.reschedule();
        Ok(id)
    }

    /// Suspend a Ready or Running thread. Self-suspension reschedules
    /// immediately.
    pub fn suspend(&mut self, id: ThreadId) -> KernelResult<()> {
        match self.thread(id)?.state {
            ThreadState::Ready => {
                self.ready.remove(id);
                self.threads[id.0].state = ThreadState::Suspended;
                Ok(())
            }
            ThreadState::Running => {
                self.current = None;
                self.threads[id.0].state = ThreadState::Suspended;
                self.reschedule();
                Ok(())
            }
            _ => Err(KernelError::InvalidState),
        }
    }

    /// Resume a Suspended thread. Anything else is reported as
    /// `InvalidState` and leaves all state untouched.
    pub fn resume(&mut self, id: ThreadId) -> KernelResult<()> {
        if self.thread(id)?.state != ThreadState::Suspended {
            return Err(KernelError::InvalidState);
        }
        self.make_ready(id);
        self.reschedule();
        Ok(())
    }

    /// Abort a thread: terminal, from any non-Dead state.
    ///
    /// The thread is removed from whatever queue holds it (for poll,
    /// every registration), its stack handle is released, and every
    /// mutex it owned is forcibly handed to the next waiter - a
    /// documented hazard, since the critical section it protected may
    /// be half-done.
    pub fn abort(&mut self, id: ThreadId) -> KernelResult<()> {
        let state = self.thread(id)?.state;
        if state.is_dead() {
            return Err(KernelError::InvalidState);
        }
        log::debug!("[sched] abort {} ({})", self.threads[id.0].name, id);

        match state {
            ThreadState::Running => self.current = None,
            ThreadState::Ready => {
                self.ready.remove(id);
            }
            ThreadState::Blocked => self.unblock_forcibly(id),
            ThreadState::Suspended | ThreadState::Dead => {}
        }

        let th = &mut self.threads[id.0];
        th.state = ThreadState::Dead;
        th.wait = None;
        th.outcome = None;
        // Stack handle goes back to the board layer
        th.stack.take();
        let held: Vec<MutexId> = th.held_mutexes.drain(..).collect();
        for m in held {
            self.mutex_force_release(m);
        }
        self.reschedule();
        Ok(())
    }

    /// Voluntarily cede the CPU: back of the caller's priority class.
    pub fn yield_now(&mut self) -> KernelResult<()> {
        let id = self.running_thread()?;
        self.current = None;
        self.make_ready(id); // fresh seq = behind its equal-priority peers
        self.reschedule();
        Ok(())
    }

    /// Block the current thread for `ticks` ticks. `sleep(0)` degrades
    /// to a yield.
    pub fn sleep(&mut self, ticks: u64) -> KernelResult<Blocking<()>> {
        let id = self.running_thread()?;
        if ticks == 0 {
            self.yield_now()?;
            return Ok(Blocking::Completed(()));
        }
        self.block_running(id, Wait::Sleep, Timeout::Ticks(ticks));
        self.reschedule();
        Ok(Blocking::Blocked)
    }

    /// Change a thread's base priority. Queue positions are reordered
    /// and, if the Running thread is no longer the most urgent, it is
    /// preempted immediately. An inheritance boost in effect is never
    /// lowered by this (the effective priority stays the more urgent of
    /// base and inherited).
    pub fn priority_set(&mut self, id: ThreadId, priority: Priority) -> KernelResult<()> {
        if !priority.is_valid() {
            return Err(KernelError::InvalidArgument("priority out of range"));
        }
        if self.thread(id)?.state.is_dead() {
            return Err(KernelError::InvalidState);
        }
        self.threads[id.0].base_priority = priority;
        self.refresh_priority_chain(id);
        self.reschedule();
        Ok(())
    }

    /// Advance the tick clock by one: expire deadlines, wake sleepers
    /// and delayed starts, then reschedule. Called by the external
    /// timer layer.
    pub fn tick(&mut self) {
        self.now += 1;
        for id in self.timeouts.expire(self.now) {
            self.on_timeout(id);
        }
        self.reschedule();
    }

    // --- internals --------------------------------------------------------

    pub(crate) fn running_thread(&self) -> KernelResult<ThreadId> {
        self.current.ok_or(KernelError::InvalidState)
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Transition a thread to Ready with a fresh enqueue seq
    pub(crate) fn make_ready(&mut self, id: ThreadId) {
        let seq = self.next_seq();
        let th = &mut self.threads[id.0];
        th.state = ThreadState::Ready;
        th.queue_seq = seq;
        let priority = th.effective_priority;
        self.ready.push(id, priority, seq);
    }

    /// Block the Running thread on `wait`, with an optional deadline.
    /// Returns the (priority, seq) pair for wait-queue insertion.
    /// The caller is responsible for the object-side bookkeeping and
    /// the final reschedule.
    pub(crate) fn block_running(
        &mut self,
        id: ThreadId,
        wait: Wait,
        timeout: Timeout,
    ) -> (Priority, u64) {
        let timer = match timeout {
            Timeout::Ticks(t) => Some(self.timeouts.schedule(self.now + t, id)),
            Timeout::None | Timeout::Forever => None,
        };
        let seq = self.next_seq();
        self.current = None;
        let th = &mut self.threads[id.0];
        th.state = ThreadState::Blocked;
        th.wait = Some(wait);
        th.timer = timer;
        th.queue_seq = seq;
        (th.effective_priority, seq)
    }

    /// End a wait: cancel the deadline, record the outcome, go Ready.
    pub(crate) fn wake(&mut self, id: ThreadId, outcome: WaitOutcome) {
        if let Some(timer) = self.threads[id.0].timer.take() {
            self.timeouts.cancel(timer);
        }
        let th = &mut self.threads[id.0];
        th.wait = None;
        th.outcome = Some(outcome);
        self.make_ready(id);
    }

    /// Run the most urgent Ready thread, preempting the current one if
    /// it is strictly less urgent. A preempted thread keeps its enqueue
    /// seq: preemption is not a new arrival, so it stays ahead of
    /// later-arriving equals.
    pub(crate) fn reschedule(&mut self) {
        let Some((best, best_priority)) = self.ready.peek() else {
            return;
        };
        match self.current {
            None => self.dispatch(best),
            Some(cur) => {
                let cur_priority = self.threads[cur.0].effective_priority;
                if best_priority.is_more_urgent_than(cur_priority) {
                    let seq = self.threads[cur.0].queue_seq;
                    self.threads[cur.0].state = ThreadState::Ready;
                    self.ready.push(cur, cur_priority, seq);
                    self.current = None;
                    self.dispatch(best);
                }
            }
        }
    }

    fn dispatch(&mut self, id: ThreadId) {
        self.ready.remove(id);
        self.threads[id.0].state = ThreadState::Running;
        self.current = Some(id);
        self.context_switches += 1;
        log::trace!("[sched] run {} ({})", self.threads[id.0].name, id);
    }

    /// A blocked thread's deadline fired: pull it out of whatever it
    /// waits on and deliver the appropriate outcome.
    fn on_timeout(&mut self, id: ThreadId) {
        let Some(th) = self.threads.get_mut(id.0) else {
            return;
        };
        if th.state != ThreadState::Blocked {
            return;
        }
        th.timer = None;
        match th.wait.take() {
            Some(Wait::Start) => self.make_ready(id),
            Some(Wait::Sleep) => {
                th.outcome = Some(WaitOutcome::Woken);
                self.make_ready(id);
            }
            Some(Wait::Mutex(m)) => {
                if let Some(mx) = self.mutexes.get_mut(m.0) {
                    mx.waiters.remove(id);
                }
                self.wake(id, WaitOutcome::TimedOut);
                // The departed waiter may have been the boost source
                if let Some(owner) = self.mutexes.get(m.0).and_then(|mx| mx.owner) {
                    self.refresh_priority_chain(owner);
                }
            }
            Some(Wait::Semaphore(s)) => {
                if let Some(sem) = self.semaphores.get_mut(s.0) {
                    sem.waiters.remove(id);
                }
                self.wake(id, WaitOutcome::TimedOut);
            }
            Some(Wait::QueuePut { queue, .. }) => {
                if let Some(q) = self.queues.get_mut(queue.0) {
                    q.senders.remove(id);
                }
                self.wake(id, WaitOutcome::TimedOut);
            }
            Some(Wait::QueueGet(queue)) => {
                if let Some(q) = self.queues.get_mut(queue.0) {
                    q.receivers.remove(id);
                }
                self.wake(id, WaitOutcome::TimedOut);
            }
            Some(Wait::Poll(events)) => {
                self.poll_deregister(id, &events);
                self.wake(id, WaitOutcome::TimedOut);
            }
            None => {}
        }
    }

    /// Abort path: atomically remove a Blocked thread from every wait
    /// structure it is registered in. A half-removed thread is a safety
    /// violation, so all of it happens inside this one critical section.
    fn unblock_forcibly(&mut self, id: ThreadId) {
        if let Some(timer) = self.threads[id.0].timer.take() {
            self.timeouts.cancel(timer);
        }
        match self.threads[id.0].wait.take() {
            Some(Wait::Mutex(m)) => {
                if let Some(mx) = self.mutexes.get_mut(m.0) {
                    mx.waiters.remove(id);
                }
                if let Some(owner) = self.mutexes.get(m.0).and_then(|mx| mx.owner) {
                    self.refresh_priority_chain(owner);
                }
            }
            Some(Wait::Semaphore(s)) => {
                if let Some(sem) = self.semaphores.get_mut(s.0) {
                    sem.waiters.remove(id);
                }
            }
            Some(Wait::QueuePut { queue, .. }) => {
                if let Some(q) = self.queues.get_mut(queue.0) {
                    q.senders.remove(id);
                }
            }
            Some(Wait::QueueGet(queue)) => {
                if let Some(q) = self.queues.get_mut(queue.0) {
                    q.receivers.remove(id);
                }
            }
            Some(Wait::Poll(events)) => self.poll_deregister(id, &events),
            Some(Wait::Start) | Some(Wait::Sleep) | None => {}
        }
    }

    // --- priority inheritance --------------------------------------------

    /// A thread's effective priority: the most urgent of its base
    /// priority and the priorities of threads waiting on mutexes it
    /// holds.
    fn inherited_ceiling(&self, id: ThreadId) -> Priority {
        let th = &self.threads[id.0];
        let mut best = th.base_priority;
        for m in &th.held_mutexes {
            if let Some(p) = self.mutexes.get(m.0).and_then(|mx| mx.waiters.highest_priority()) {
                if p.is_more_urgent_than(best) {
                    best = p;
                }
            }
        }
        best
    }

    /// Apply a new effective priority and reorder whatever queue the
    /// thread sits in. Returns false if nothing changed.
    fn apply_effective(&mut self, id: ThreadId, priority: Priority) -> bool {
        let th = &mut self.threads[id.0];
        if th.effective_priority == priority {
            return false;
        }
        th.effective_priority = priority;
        match th.state {
            ThreadState::Ready => {
                self.ready.reprioritize(id, priority);
            }
            ThreadState::Blocked => match &self.threads[id.0].wait {
                Some(Wait::Mutex(m)) => {
                    let m = *m;
                    if let Some(mx) = self.mutexes.get_mut(m.0) {
                        mx.waiters.reprioritize(id, priority);
                    }
                }
                Some(Wait::Semaphore(s)) => {
                    let s = *s;
                    if let Some(sem) = self.semaphores.get_mut(s.0) {
                        sem.waiters.reprioritize(id, priority);
                    }
                }
                Some(Wait::QueuePut { queue, .. }) => {
                    let queue = *queue;
                    if let Some(q) = self.queues.get_mut(queue.0) {
                        q.senders.reprioritize(id, priority);
                    }
                }
                Some(Wait::QueueGet(queue)) => {
                    let queue = *queue;
                    if let Some(q) = self.queues.get_mut(queue.0) {
                        q.receivers.reprioritize(id, priority);
                    }
                }
                // Poll registrations and pure sleeps carry no order
                _ => {}
            },
            ThreadState::Running | ThreadState::Suspended | ThreadState::Dead => {}
        }
        true
    }

    /// Recompute effective priorities along the mutex ownership chain
    /// starting at `start`: if the thread's ceiling changed and it is
    /// itself blocked on a mutex, the owner of that mutex inherits the
    /// change, and so on. The walk is bounded by `PI_CHAIN_MAX` instead
    /// of recursing.
    pub(crate) fn refresh_priority_chain(&mut self, start: ThreadId) {
        let mut id = start;
        for _ in 0..PI_CHAIN_MAX {
            let ceiling = self.inherited_ceiling(id);
            if !self.apply_effective(id, ceiling) {
                break;
            }
            let next = match &self.threads[id.0].wait {
                Some(Wait::Mutex(m)) => self.mutexes.get(m.0).and_then(|mx| mx.owner),
                _ => None,
            };
            match next {
                Some(owner) if owner != id => id = owner,
                _ => break,
            }
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
