//! # Synchronization Primitives
//!
//! Interrupt-safe lock abstraction for kernel state.
//!
//! Every piece of shared scheduler or allocator state lives behind an
//! [`IrqLock`]. Taking the lock first masks interrupts on the local core
//! (through the `critical-section` implementation selected for the target)
//! and then acquires a spinlock, which serializes against other cores.
//! The returned guard undoes both steps in reverse order when it is
//! dropped, on every exit path.
//!
//! On bare-metal targets the critical section is provided by `cortex-m`
//! (PRIMASK). On the hosted target it is `critical-section`'s std
//! implementation, a process-wide reentrant lock.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use critical_section::RestoreState;
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// A spinlock that also masks interrupts while held.
///
/// Guards must be dropped in the reverse order they were taken. The kernel
/// never holds two `IrqLock`s across a blocking or yielding boundary.
pub struct IrqLock<T> {
    inner: SpinMutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinMutex::new(value),
        }
    }

    /// Mask interrupts and acquire the lock.
    #[inline]
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        // Safety: the matching release happens in `IrqLockGuard::drop`,
        // after the spinlock guard has been dropped.
        let restore = unsafe { critical_section::acquire() };
        IrqLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            restore,
        }
    }
}

/// RAII guard returned by [`IrqLock::lock`].
pub struct IrqLockGuard<'a, T> {
    guard: ManuallyDrop<SpinMutexGuard<'a, T>>,
    restore: RestoreState,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: the spinlock guard is dropped exactly once, here, and the
        // restore token came from the `acquire` in `IrqLock::lock`.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            critical_section::release(self.restore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = IrqLock::new(5u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        // Would spin forever if the first guard leaked the spinlock.
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_nested_distinct_locks() {
        let a = IrqLock::new(1u32);
        let b = IrqLock::new(2u32);
        let ga = a.lock();
        let gb = b.lock();
        assert_eq!(*ga + *gb, 3);
        drop(gb);
        drop(ga);
        assert_eq!(*a.lock(), 1);
    }

    #[test]
    fn test_early_return_releases() {
        fn bump_if_small(lock: &IrqLock<u32>) -> bool {
            let mut g = lock.lock();
            if *g > 10 {
                return false;
            }
            *g += 1;
            true
        }
        let lock = IrqLock::new(11u32);
        assert!(!bump_if_small(&lock));
        assert_eq!(*lock.lock(), 11);
    }
}
