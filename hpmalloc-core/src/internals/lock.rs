//! A spin lock, living inside an arena.
//!
//! The lock is a single byte of the arena, hence it is shared by every process mapping the arena.

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

#[derive(Default)]
pub(crate) struct RawLock(AtomicBool);

impl RawLock {
    /// Acquires the lock, spinning until it is available.
    pub(crate) fn lock(&self) -> LockGuard<'_> {
        self.acquire();

        LockGuard(self)
    }

    /// Acquires the lock, if immediately available.
    #[cfg(test)]
    pub(crate) fn try_lock(&self) -> Option<LockGuard<'_>> {
        if self.0.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            Some(LockGuard(self))
        } else {
            None
        }
    }

    /// Acquires the lock, without a guard.
    ///
    /// The lock must later be released with `release`.
    pub(crate) fn acquire(&self) {
        loop {
            if !self.0.swap(true, Ordering::Acquire) {
                return;
            }

            //  Spin on a load, to avoid bouncing the cache line between contenders.
            while self.0.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Releases the lock.
    ///
    /// #   Safety
    ///
    /// -   Assumes the lock was acquired by the caller, with `acquire`.
    pub(crate) unsafe fn release(&self) { self.0.store(false, Ordering::Release) }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool { self.0.load(Ordering::Relaxed) }
}

pub(crate) struct LockGuard<'a>(&'a RawLock);

/// Whether an operation takes the locks it needs.
///
/// Only single-process bootstrap code, and tests, run unlocked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Locking {
    Locked,
    Unlocked,
}

impl Locking {
    /// Acquires `lock`, if locking.
    pub(crate) fn guard<'a>(&self, lock: &'a RawLock) -> Option<LockGuard<'a>> {
        match self {
            Locking::Locked => Some(lock.lock()),
            Locking::Unlocked => None,
        }
    }
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        //  Safety:
        //  -   The guard is only created on acquisition.
        unsafe { self.0.release() }
    }
}
