//! Bounded message queues
//!
//! Fixed-size messages in a fixed-capacity ring; messages are copied in
//! and out, never shared. FIFO among messages is absolute. Waiting
//! threads (senders on a full queue, receivers on an empty one) are
//! served by priority then FIFO, like every other wait queue.
//!
//! Hand-offs are direct in both directions: a put with a queued
//! receiver bypasses the ring entirely, and a get that opens a slot
//! immediately pulls in the most urgent blocked sender, so the ring is
//! full again before anything else can run.

use super::error::{KernelError, KernelResult};
use super::scheduler::{Blocking, Kernel, Wait, WaitOutcome};
use super::thread::ThreadId;
use super::timer::Timeout;
use super::waitqueue::WaitQueue;

/// Message queue identifier (index into the kernel's queue table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub usize);

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "msgq:{}", self.0)
    }
}

/// Message queue state, owned by the kernel table
pub(crate) struct KernelMsgQueue {
    pub(crate) msg_size: usize,
    pub(crate) capacity: usize,
    /// Ring storage, `msg_size * capacity` bytes
    buffer: Vec<u8>,
    /// Slot index of the oldest message
    head: usize,
    /// Messages currently stored
    occupied: usize,
    pub(crate) senders: WaitQueue,
    pub(crate) receivers: WaitQueue,
    /// Threads with a poll registration on this queue
    pub(crate) pollers: Vec<ThreadId>,
    /// Lifetime counters (diagnostic)
    sent: u64,
    received: u64,
}

impl KernelMsgQueue {
    pub(crate) fn is_full(&self) -> bool {
        self.occupied == self.capacity
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Copy a message into the tail slot. Caller checks capacity.
    fn push_copy(&mut self, msg: &[u8]) {
        debug_assert!(!self.is_full());
        let slot = (self.head + self.occupied) % self.capacity;
        let at = slot * self.msg_size;
        self.buffer[at..at + self.msg_size].copy_from_slice(msg);
        self.occupied += 1;
        self.sent += 1;
    }

    /// Copy the oldest message out. Caller checks occupancy.
    fn pop_copy(&mut self) -> Vec<u8> {
        debug_assert!(!self.is_empty());
        let at = self.head * self.msg_size;
        let msg = self.buffer[at..at + self.msg_size].to_vec();
        self.head = (self.head + 1) % self.capacity;
        self.occupied -= 1;
        self.received += 1;
        msg
    }
}

impl Kernel {
    pub fn msgq_create(&mut self, msg_size: usize, capacity: usize) -> KernelResult<QueueId> {
        if msg_size == 0 {
            return Err(KernelError::InvalidArgument("msg_size must be >= 1"));
        }
        if capacity == 0 {
            return Err(KernelError::InvalidArgument("capacity must be >= 1"));
        }
        let id = QueueId(self.queues.insert(KernelMsgQueue {
            msg_size,
            capacity,
            buffer: vec![0; msg_size * capacity],
            head: 0,
            occupied: 0,
            senders: WaitQueue::new(),
            receivers: WaitQueue::new(),
            pollers: Vec::new(),
            sent: 0,
            received: 0,
        }));
        log::debug!("[msgq] created {id} ({capacity} x {msg_size}B)");
        Ok(id)
    }

    /// Send a message on behalf of the current thread. `msg` must be
    /// exactly `msg_size` bytes.
    pub fn msgq_put(
        &mut self,
        qid: QueueId,
        msg: &[u8],
        timeout: Timeout,
    ) -> KernelResult<Blocking<()>> {
        let caller = self.running_thread()?;
        let q = self.queues.get_mut(qid.0).ok_or(KernelError::NotFound)?;
        if msg.len() != q.msg_size {
            return Err(KernelError::InvalidArgument("message size mismatch"));
        }

        // A queued receiver outranks the ring: hand the message over
        // directly. The ring must be empty for a receiver to be queued.
        if let Some(receiver) = q.receivers.pop_front() {
            q.sent += 1;
            q.received += 1;
            self.wake(receiver, WaitOutcome::Received(msg.to_vec()));
            self.reschedule();
            return Ok(Blocking::Completed(()));
        }

        if !q.is_full() {
            q.push_copy(msg);
            // Waking a poller may make a more urgent thread runnable
            self.poll_notify_queue(qid);
            self.reschedule();
            return Ok(Blocking::Completed(()));
        }

        if timeout.is_immediate() {
            return Err(KernelError::Timeout);
        }
        let wait = Wait::QueuePut { queue: qid, msg: msg.to_vec() };
        let (priority, seq) = self.block_running(caller, wait, timeout);
        self.queues[qid.0].senders.insert(caller, priority, seq);
        log::trace!("[msgq] {caller} blocks sending on {qid}");
        self.reschedule();
        Ok(Blocking::Blocked)
    }

    /// Receive the oldest message on behalf of the current thread.
    pub fn msgq_get(&mut self, qid: QueueId, timeout: Timeout) -> KernelResult<Blocking<Vec<u8>>> {
        let caller = self.running_thread()?;
        let q = self.queues.get_mut(qid.0).ok_or(KernelError::NotFound)?;

        if !q.is_empty() {
            let msg = q.pop_copy();
            // A slot opened: pull in the most urgent blocked sender
            // before anything else can observe the gap.
            self.admit_blocked_sender(qid);
            self.poll_notify_queue(qid);
            self.reschedule();
            return Ok(Blocking::Completed(msg));
        }

        if timeout.is_immediate() {
            return Err(KernelError::Timeout);
        }
        let (priority, seq) = self.block_running(caller, Wait::QueueGet(qid), timeout);
        self.queues[qid.0].receivers.insert(caller, priority, seq);
        log::trace!("[msgq] {caller} blocks receiving on {qid}");
        self.reschedule();
        Ok(Blocking::Blocked)
    }

    /// Message count currently stored (diagnostic)
    pub fn msgq_len(&self, qid: QueueId) -> KernelResult<usize> {
        Ok(self.queues.get(qid.0).ok_or(KernelError::NotFound)?.occupied)
    }

    /// Lifetime (sent, received) counters (diagnostic)
    pub fn msgq_stats(&self, qid: QueueId) -> KernelResult<(u64, u64)> {
        let q = self.queues.get(qid.0).ok_or(KernelError::NotFound)?;
        Ok((q.sent, q.received))
    }

    /// Move the most urgent blocked sender's message into the ring and
    /// wake it.
    fn admit_blocked_sender(&mut self, qid: QueueId) {
        let Some(sender) = self.queues[qid.0].senders.pop_front() else {
            return;
        };
        let msg = match self.threads[sender.0].wait.take() {
            Some(Wait::QueuePut { msg, .. }) => msg,
            other => {
                // Wait-queue membership and the control block always
                // agree; restore and bail if they somehow do not.
                self.threads[sender.0].wait = other;
                return;
            }
        };
        self.queues[qid.0].push_copy(&msg);
        self.wake(sender, WaitOutcome::Sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::scheduler::ThreadSpec;
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
    fn test_create_validation() {
        let mut k = Kernel::new();
        assert!(k.msgq_create(0, 4).is_err());
        assert!(k.msgq_create(8, 0).is_err());
        assert!(k.msgq_create(8, 4).is_ok());
    }

    #[test]
    fn test_fifo_message_order() {
        let mut k = Kernel::new();
        spawn(&mut k, "a", 5);
        let q = k.msgq_create(2, 4).unwrap();

        k.msgq_put(q, &[1, 1], Timeout::None).unwrap();
        k.msgq_put(q, &[2, 2], Timeout::None).unwrap();
        k.msgq_put(q, &[3, 3], Timeout::None).unwrap();
        assert_eq!(k.msgq_len(q).unwrap(), 3);

        assert_eq!(k.msgq_get(q, Timeout::None).unwrap().completed(), Some(vec![1, 1]));
        assert_eq!(k.msgq_get(q, Timeout::None).unwrap().completed(), Some(vec![2, 2]));
        assert_eq!(k.msgq_get(q, Timeout::None).unwrap().completed(), Some(vec![3, 3]));
        assert_eq!(k.msgq_len(q).unwrap(), 0);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut k = Kernel::new();
        spawn(&mut k, "a", 5);
        let q = k.msgq_create(4, 2).unwrap();
        assert!(matches!(
            k.msgq_put(q, &[1, 2], Timeout::None),
            Err(KernelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_full_queue_fails_or_blocks() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 7);
        let q = k.msgq_create(1, 1).unwrap();

        k.msgq_put(q, &[9], Timeout::None).unwrap();
        assert_eq!(k.msgq_put(q, &[8], Timeout::None), Err(KernelError::Timeout));
        assert_eq!(k.msgq_put(q, &[8], Timeout::Forever).unwrap(), Blocking::Blocked);
        // a blocked as a sender, b runs
        assert_eq!(k.current(), Some(b));
        let _ = a;
    }

    #[test]
    fn test_get_admits_blocked_sender() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let q = k.msgq_create(1, 1).unwrap();
        k.msgq_put(q, &[1], Timeout::None).unwrap();
        k.msgq_put(q, &[2], Timeout::Forever).unwrap(); // a blocks with msg [2]

        // b drains one slot: a's message must land in the ring at once
        let _b = spawn(&mut k, "b", 7);
        assert_eq!(k.msgq_get(q, Timeout::None).unwrap().completed(), Some(vec![1]));
        assert_eq!(k.msgq_len(q).unwrap(), 1);
        assert_eq!(k.take_outcome(a), Some(WaitOutcome::Sent));

        // a woke at higher priority and preempted b
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.msgq_get(q, Timeout::None).unwrap().completed(), Some(vec![2]));
    }

    #[test]
    fn test_put_hands_message_to_blocked_receiver() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 2);
        let b = spawn(&mut k, "b", 7);
        let q = k.msgq_create(3, 2).unwrap();

        assert_eq!(k.msgq_get(q, Timeout::Forever).unwrap(), Blocking::Blocked);
        assert_eq!(k.current(), Some(b));

        k.msgq_put(q, &[7, 7, 7], Timeout::None).unwrap();
        // Bypassed the ring entirely
        assert_eq!(k.msgq_len(q).unwrap(), 0);
        assert_eq!(k.take_outcome(a), Some(WaitOutcome::Received(vec![7, 7, 7])));
        assert_eq!(k.current(), Some(a));
    }

    #[test]
    fn test_receive_timeout() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let q = k.msgq_create(1, 1).unwrap();

        assert_eq!(k.msgq_get(q, Timeout::Ticks(2)).unwrap(), Blocking::Blocked);
        k.tick();
        k.tick();
        assert_eq!(k.take_outcome(a), Some(WaitOutcome::TimedOut));
        assert_eq!(k.current(), Some(a));
    }

    #[test]
    fn test_blocked_senders_admitted_by_priority() {
        let mut k = Kernel::new();
        let low = spawn(&mut k, "low", 8);
        let q = k.msgq_create(1, 1).unwrap();
        k.msgq_put(q, &[0], Timeout::None).unwrap();
        k.msgq_put(q, &[1], Timeout::Forever).unwrap(); // low blocks

        let high = spawn(&mut k, "high", 3);
        k.msgq_put(q, &[2], Timeout::Forever).unwrap(); // high blocks

        let drainer = spawn(&mut k, "drainer", 1);
        assert_eq!(k.msgq_get(q, Timeout::None).unwrap().completed(), Some(vec![0]));
        // The more urgent sender got the slot despite arriving later
        assert_eq!(k.take_outcome(high), Some(WaitOutcome::Sent));
        assert_eq!(k.msgq_get(q, Timeout::None).unwrap().completed(), Some(vec![2]));
        assert_eq!(k.take_outcome(low), Some(WaitOutcome::Sent));
        assert_eq!(k.msgq_get(q, Timeout::None).unwrap().completed(), Some(vec![1]));
        let _ = drainer;
    }

    #[test]
    fn test_put_preempts_more_urgent_poller() {
        use crate::kernel::poll::PollEvent;

        let mut k = Kernel::new();
        let poller = spawn(&mut k, "poller", 2);
        let q = k.msgq_create(1, 2).unwrap();
        assert_eq!(
            k.poll_wait(vec![PollEvent::queue_non_empty(q)], Timeout::Forever).unwrap(),
            Blocking::Blocked
        );

        // A less urgent producer fills a slot; the woken poller must
        // take the CPU before the put returns to the producer
        let producer = spawn(&mut k, "producer", 6);
        k.msgq_put(q, &[1], Timeout::None).unwrap();
        assert_eq!(k.current(), Some(poller));
        assert_eq!(k.take_outcome(poller), Some(WaitOutcome::Poll(vec![0])));
        let _ = producer;
    }

    #[test]
    fn test_stats() {
        let mut k = Kernel::new();
        spawn(&mut k, "a", 5);
        let q = k.msgq_create(1, 2).unwrap();
        k.msgq_put(q, &[1], Timeout::None).unwrap();
        k.msgq_put(q, &[2], Timeout::None).unwrap();
        k.msgq_get(q, Timeout::None).unwrap();
        assert_eq!(k.msgq_stats(q).unwrap(), (2, 1));
    }
}
