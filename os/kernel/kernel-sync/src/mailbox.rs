use crate::SpinMutex;
use alloc::collections::VecDeque;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A multi-producer, single-consumer request queue owned by one CPU.
///
/// Senders [`post`](Mailbox::post) from any CPU; the owner drains it from
/// its interrupt path (or, in simulation, whenever it polls).
pub struct Mailbox<T> {
    queue: SpinMutex<VecDeque<T>>,
    pending: AtomicUsize,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: SpinMutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn post(&self, msg: T) {
        self.queue.with_lock(|q| q.push_back(msg));
        self.pending.fetch_add(1, Ordering::Release);
    }

    /// Cheap check that skips the lock when nothing is queued.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Pop and handle every queued message. The queue lock is not held while
    /// `handle` runs. Returns how many messages were handled.
    pub fn drain(&self, mut handle: impl FnMut(T)) -> usize {
        let mut handled = 0;
        while self.has_pending() {
            let Some(msg) = self.queue.with_lock(VecDeque::pop_front) else {
                break;
            };
            self.pending.fetch_sub(1, Ordering::AcqRel);
            handle(msg);
            handled += 1;
        }
        handled
    }
}

/// Countdown shared between a caller and the CPUs it is waiting on.
///
/// # Examples
///
/// ```
/// use kernel_sync::Completion;
///
/// let done = Completion::new(2);
/// done.signal();
/// assert!(!done.is_done());
/// done.signal();
/// done.wait(|| unreachable!("already complete"));
/// ```
#[derive(Debug)]
pub struct Completion {
    remaining: AtomicUsize,
}

impl Completion {
    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    /// Acknowledge one unit of work.
    pub fn signal(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "completion signalled too often");
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    /// Block until every acknowledgment arrived, calling `poll` between
    /// checks. There is no timeout.
    pub fn wait(&self, mut poll: impl FnMut()) {
        while !self.is_done() {
            poll();
            spin_loop();
        }
    }
}
