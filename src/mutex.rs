/*
 * Spin Mutex
 *
 * A test-and-set spin lock for the runtime's cross-unit shared state
 * (channels, the allocator tail). A claimant spins a bounded number of
 * times and then yields the processor to the next ready process, so a
 * process that finds the lock held by a preempted peer on the same unit
 * cannot spin forever.
 *
 * Rules observed by all callers:
 * - never claimed with interrupts disabled (yielding would carry the
 *   disabled state into another process)
 * - never claimed from an interrupt handler
 */

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::scheduler;

/// Exchange attempts before giving up the processor.
const TRIALS_BEFORE_YIELD: usize = 5;

pub struct SpinMutex<T> {
    claimed: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

pub struct SpinMutexGuard<'a, T> {
    lock: &'a SpinMutex<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> SpinMutex<T> {
        SpinMutex {
            claimed: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Claims exclusive access, yielding after a bounded spin.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        loop {
            for _ in 0..TRIALS_BEFORE_YIELD {
                if !self.claimed.swap(true, Ordering::AcqRel) {
                    return SpinMutexGuard { lock: self };
                }
                core::hint::spin_loop();
            }
            scheduler::yield_now();
        }
    }
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.claimed.store(false, Ordering::Release);
    }
}
