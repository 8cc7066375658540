//! Spin locks
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, RawLock};

/// Mutual exclusion lock that busy waits (spin).
pub struct RawSpinLock {
    /// Name of lock for debugging.
    name: &'static str,

    locked: AtomicBool,
}

/// Locks that busy wait (spin). Must not be held across a suspension point,
/// except through `WaitChannel::sleep`, which releases the raw lock before
/// the process is parked.
pub type SpinLock<T> = Lock<RawSpinLock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinLock, T>;

impl RawSpinLock {
    /// Mutual exclusion spin locks.
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
        }
    }
}

impl RawLock for RawSpinLock {
    /// Acquires the lock. Loops (spins) until the lock is acquired.
    ///
    /// Stores done in one critical section are made visible to the next
    /// critical section's loads by the `Acquire`/`Release` pair on `locked`.
    fn acquire(&self) {
        let mut spins = 0u32;
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
            spins += 1;
            // The holder may itself be descheduled by the host; hand the OS
            // the core instead of spinning against a parked thread.
            if spins % 64 == 0 {
                std::thread::yield_now();
            }
        }
    }

    fn release(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed), "release {}", self.name);
        self.locked.store(false, Ordering::Release);
    }
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}
