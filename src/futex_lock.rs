use std::sync::atomic::Ordering;

use linux_futex::{Futex, Private};

/// This futex represents a lock and is unlocked
const FUTEX_UNLOCKED: u32 = 0;

/// This futex represents a lock and is locked, with nobody asleep on it
const FUTEX_LOCKED: u32 = 1;

/// Locked, and somebody may be asleep waiting for it
const FUTEX_CONTENDED: u32 = 2;

/// A mutex that needs nothing but one `u32`. `std::sync::Mutex` would do on
/// Linux too, but this one is `const`, never poisons, and is guaranteed
/// never to allocate, which is the whole point when you are the allocator.
///
/// Not reentrant: locking twice from one thread deadlocks. The hook guard in
/// [`crate::thread`] keeps the interposer from doing that.
pub struct FutexLock {
    futex: Futex<Private>,
}

/// RAII guard, `Drop` releases the lock
pub struct FutexLockGuard<'a> {
    lock: &'a FutexLock,
}

impl FutexLock {
    pub const fn new() -> Self {
        Self {
            futex: Futex::new(FUTEX_UNLOCKED),
        }
    }

    pub fn lock(&self) -> FutexLockGuard<'_> {
        // Fast path should stay in userspace!
        if self
            .futex
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            self.lock_contended();
        }
        FutexLockGuard { lock: self }
    }

    #[cold]
    fn lock_contended(&self) {
        // Once we have been contended we always take the lock as CONTENDED,
        // since we can't know whether anybody else is still sleeping.
        while self.futex.value.swap(FUTEX_CONTENDED, Ordering::Acquire) != FUTEX_UNLOCKED {
            _ = self.futex.wait(FUTEX_CONTENDED);
        }
    }

    fn unlock(&self) {
        if self.futex.value.swap(FUTEX_UNLOCKED, Ordering::Release) == FUTEX_CONTENDED {
            self.futex.wake(1);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.futex.value.load(Ordering::Relaxed) != FUTEX_UNLOCKED
    }
}

impl Default for FutexLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FutexLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
