//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion,
//! and also includes traits that express their behaviors.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};

/// Raw locks that can be acquired and released.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
}

/// Locks that own their own `RawLock` and `data: T`.
pub struct Lock<R: RawLock, T> {
    pub(super) lock: R,
    data: UnsafeCell<T>,
}

/// Guards of `Lock<R, T>`.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    _marker: PhantomData<*const ()>,
}

// SAFETY: `Lock` provides the inner data only through guards, which
// guarantee exclusive access while they are alive.
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

/// Represents lock guards that can be slept in a `WaitChannel`.
pub trait Waitable {
    /// Releases the inner raw lock.
    ///
    /// # Safety
    ///
    /// `raw_release()` and `raw_acquire()` must always be used as a pair.
    /// Use these only for temporarily releasing (and then acquiring) the
    /// lock. Do not access the guarded data until `raw_acquire()`.
    unsafe fn raw_release(&mut self);

    /// Acquires the inner raw lock.
    ///
    /// # Safety
    ///
    /// See `raw_release()`.
    unsafe fn raw_acquire(&mut self);
}

impl<R: RawLock, T> Lock<R, T> {
    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns a mutable reference to the inner data.
    ///
    /// # Safety
    ///
    /// The caller must ensure that accessing the pointer does not incur race.
    pub unsafe fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data. Safe since `&mut self`
    /// guarantees exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: we have a mutable reference to the lock.
        unsafe { &mut *self.data.get() }
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock while running `f`, and reacquires it
    /// before returning.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<R: RawLock, T> Waitable for Guard<'_, R, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the lock is held while the guard is alive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the lock is held and `&mut self` is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
