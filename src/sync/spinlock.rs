//! SMP-supported spinlock.
//!
//! All scheduler state lives behind a single lock of this kind, so the
//! guard is deliberately noisy: it records the acquisition site and panics
//! when dropped without an explicit [`SpinLockGuard::unlock`], which makes a
//! forgotten release show up at the offending call site instead of as a
//! silent deadlock later.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// This spinlock will busy-wait until the lock becomes available. The
/// spinlock can be created via a [`new`] constructor. Each spinlock has a
/// type parameter which represents the data that it is protecting. The data
/// can only be accessed through the guards returned from [`lock`] and
/// [`try_lock`], which guarantees that the data is only ever accessed when
/// the spinlock is locked.
///
/// [`new`]: Self::new
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the spinlock, spinning until it is able to do so.
    ///
    /// Upon returning, the caller is the only holder of the lock. The guard
    /// must be released with [`SpinLockGuard::unlock`]; letting it go out of
    /// scope while still holding the lock panics.
    ///
    /// The exact behavior on locking a spinlock in the thread which already
    /// holds the lock is left unspecified; this function will not return on
    /// the second call.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        while self.locked.fetch_or(true, Ordering::Acquire) {
            backoff.snooze();
        }
        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            held: true,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// If the lock could not be acquired at this time, [`WouldBlock`] is
    /// returned. Otherwise, a guard is returned as with [`SpinLock::lock`].
    /// This function does not spin.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if self.locked.fetch_or(true, Ordering::Acquire) {
            Err(WouldBlock)
        } else {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
                held: true,
            })
        }
    }
}

/// An RAII-discouraging guard for [`SpinLock`].
///
/// Dereferences to the protected data; must be released explicitly through
/// [`SpinLockGuard::unlock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    held: bool,
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the lock.
    pub fn unlock(mut self) {
        self.held = false;
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if self.held {
            panic!("SpinLockGuard acquired at {} dropped while held", self.caller);
        }
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_round_trip() {
        let lock = SpinLock::new(41);
        let mut guard = lock.lock();
        *guard += 1;
        guard.unlock();

        let guard = lock.lock();
        assert_eq!(*guard, 42);
        guard.unlock();
    }

    #[test]
    fn try_lock_contended() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        guard.unlock();
        let reguard = lock.try_lock().ok().unwrap();
        reguard.unlock();
    }
}
