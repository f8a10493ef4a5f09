use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::sync::atomic::{AtomicU32, Ordering};

/// Per-CPU "interrupts disabled" state.
///
/// Every CPU owns one `CriticalSection`. Entering it models disabling
/// interrupts on that CPU: nesting is counted, and only the outermost exit
/// re-enables. Code that may only run with interrupts off (tag allocation,
/// window slots) asserts [`CriticalSection::is_active`].
///
/// # Examples
///
/// ```
/// use kernel_sync::CriticalSection;
///
/// let cs = CriticalSection::new();
/// {
///     let _outer = cs.enter();
///     let _inner = cs.enter();
///     assert_eq!(cs.depth(), 2);
/// }
/// assert!(!cs.is_active());
/// ```
#[derive(Debug, Default)]
pub struct CriticalSection {
    depth: AtomicU32,
}

impl CriticalSection {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
        }
    }

    /// Disable interrupts until the returned guard is dropped.
    #[inline]
    #[must_use]
    pub fn enter(&self) -> CriticalGuard<'_> {
        self.depth.fetch_add(1, Ordering::Acquire);
        CriticalGuard { cs: self }
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }
}

/// RAII guard for one level of [`CriticalSection`] nesting.
pub struct CriticalGuard<'a> {
    cs: &'a CriticalSection,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        let prev = self.cs.depth.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "critical section underflow");
    }
}

/// A mutex guard that also keeps a critical section entered while held.
///
/// Created by [`Mutex::lock_critical`]. Releases the mutex first, then
/// leaves the critical section.
pub struct CriticalMutexGuard<'a, T, R: RawLock + RawUnlock> {
    guard: MutexGuard<'a, T, R>,
    _cs: CriticalGuard<'a>,
}

impl<T, R: RawLock + RawUnlock> core::ops::Deref for CriticalMutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock + RawUnlock> core::ops::DerefMut for CriticalMutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Enters `cs`, then acquires the mutex.
    #[inline]
    pub fn lock_critical<'a>(&'a self, cs: &'a CriticalSection) -> CriticalMutexGuard<'a, T, R> {
        let critical = cs.enter();
        let guard = self.lock();
        CriticalMutexGuard {
            guard,
            _cs: critical,
        }
    }
}
