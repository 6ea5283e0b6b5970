//! Bucket
//!
//! The head of a free list, with its lock and statistics.
//!
//! Each class has a primary bucket. In a shared arena, each class also owns a contiguous range of sub-buckets, which
//! are only used once the class is optimized: the class then spreads its free fragments over the sub-buckets,
//! selected in a round-robin fashion, to reduce contention.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::atomic::{AtomicOffset, Counter, Offset};
use super::lock::{LockGuard, RawLock};

#[repr(C)]
#[derive(Default)]
pub(crate) struct Bucket {
    lock: RawLock,
    optimized: AtomicBool,
    head: AtomicOffset,
    //  Only maintained with `StatsMode::Fast`.
    free_fragments: Counter,
    free_bytes: Counter,
    //  Round-robin cursors over the sub-buckets, best effort.
    get_cursor: AtomicUsize,
    put_cursor: AtomicUsize,
}

impl Bucket {
    pub(crate) fn lock(&self) -> LockGuard<'_> { self.lock.lock() }

    pub(crate) fn raw_lock(&self) -> &RawLock { &self.lock }

    pub(crate) fn is_optimized(&self) -> bool { self.optimized.load(Ordering::Relaxed) }

    pub(crate) fn set_optimized(&self) { self.optimized.store(true, Ordering::Relaxed) }

    pub(crate) fn head(&self) -> Option<Offset> { self.head.load() }

    pub(crate) fn set_head(&self, head: Option<Offset>) { self.head.store(head) }

    pub(crate) fn free_fragments(&self) -> usize { self.free_fragments.load() }

    pub(crate) fn free_bytes(&self) -> usize { self.free_bytes.load() }

    pub(crate) fn record_attach(&self, size: usize) {
        self.free_fragments.add(1);
        self.free_bytes.add(size);
    }

    pub(crate) fn record_detach(&self, size: usize) {
        self.free_fragments.sub(1);
        self.free_bytes.sub(size);
    }

    /// Returns the sub-bucket to allocate from next, out of `secondary`.
    pub(crate) fn next_get(&self, secondary: usize) -> usize {
        debug_assert!(secondary > 0);

        self.get_cursor.fetch_add(1, Ordering::Relaxed) % secondary
    }

    /// Returns the sub-bucket to release into next, out of `secondary`.
    pub(crate) fn next_put(&self, secondary: usize) -> usize {
        debug_assert!(secondary > 0);

        self.put_cursor.fetch_add(1, Ordering::Relaxed) % secondary
    }
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn bucket_cursors_round_robin() {
    let bucket = Bucket::default();

    let gets: [usize; 5] = [0, 1, 2, 0, 1];

    for expected in gets.iter() {
        assert_eq!(*expected, bucket.next_get(3));
    }

    //  Independent from the get cursor.
    assert_eq!(0, bucket.next_put(3));
    assert_eq!(1, bucket.next_put(3));
}

#[test]
fn bucket_statistics() {
    let bucket = Bucket::default();

    bucket.record_attach(64);
    bucket.record_attach(32);
    bucket.record_detach(64);

    assert_eq!(1, bucket.free_fragments());
    assert_eq!(32, bucket.free_bytes());
}

}
