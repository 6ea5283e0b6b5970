//! Building bricks for structures living inside an arena.
//!
//! All accesses are Relaxed: the bucket locks provide the synchronization, and unlocked reads are always re-verified
//! under the appropriate lock.

use core::{
    num::NonZeroUsize,
    sync::atomic::{self, Ordering},
};

/// Offset of a fragment from the start of its arena.
///
/// Offsets, rather than pointers, are stored in the arena so that its content does not depend on the address at which
/// it is mapped.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct Offset(NonZeroUsize);

impl Offset {
    /// Creates an Offset, or None if `value` is 0.
    pub(crate) fn new(value: usize) -> Option<Offset> { NonZeroUsize::new(value).map(Offset) }

    /// Returns the inner value.
    pub(crate) fn value(&self) -> usize { self.0.get() }

    /// Returns an Offset `delta` bytes further.
    pub(crate) fn add(&self, delta: usize) -> Offset {
        let value = self.value() + delta;

        //  Safety:
        //  -   `value` is greater than or equal to `self.value()`, which is not 0.
        Offset(unsafe { NonZeroUsize::new_unchecked(value) })
    }
}

#[derive(Default)]
pub(crate) struct AtomicOffset(atomic::AtomicUsize);

impl AtomicOffset {
    pub(crate) fn load(&self) -> Option<Offset> { Offset::new(self.0.load(Ordering::Relaxed)) }

    pub(crate) fn store(&self, offset: Option<Offset>) {
        self.0.store(offset.map(|o| o.value()).unwrap_or(0), Ordering::Relaxed)
    }
}

/// A counter, updated concurrently on a best-effort basis.
#[derive(Default)]
pub(crate) struct Counter(atomic::AtomicUsize);

impl Counter {
    pub(crate) fn new(value: usize) -> Self { Self(atomic::AtomicUsize::new(value)) }

    pub(crate) fn load(&self) -> usize { self.0.load(Ordering::Relaxed) }

    pub(crate) fn store(&self, value: usize) { self.0.store(value, Ordering::Relaxed) }

    pub(crate) fn add(&self, value: usize) -> usize { self.0.fetch_add(value, Ordering::Relaxed) + value }

    pub(crate) fn sub(&self, value: usize) { self.0.fetch_sub(value, Ordering::Relaxed); }

    //  Raises the counter to `value`, if lower.
    pub(crate) fn raise(&self, value: usize) { self.0.fetch_max(value, Ordering::Relaxed); }
}
