//! # Kernel synchronization primitives
//!
//! Locks, critical sections and the cross-CPU mailbox used by the
//! translation manager.
//!
//! * [`SpinMutex`]: test-and-test-and-set lock for short per-object sections
//!   (one per address space, per-CPU TLB state).
//! * [`TicketMutex`]: FIFO lock for the single, heavily shared frame-queue
//!   lock, so no CPU starves behind a busy neighbour.
//! * [`CriticalSection`]: per-CPU "interrupts disabled" nesting counter;
//!   state that must only change with interrupts off asserts on it.
//! * [`Mailbox`] and [`Completion`]: the request queue and acknowledgment
//!   counter behind synchronous cross-CPU calls.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod critical;
mod mailbox;
mod mutex;
mod raw;

pub use critical::{CriticalGuard, CriticalMutexGuard, CriticalSection};
pub use mailbox::{Completion, Mailbox};
pub use mutex::{Mutex, MutexGuard};
pub use raw::{RawSpin, RawTicket};

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;

    /// Snapshot of the lock state; only meaningful for assertions.
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
