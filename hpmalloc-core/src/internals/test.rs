//! Helpers for tests.

use core::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use alloc::alloc as heap;

use crate::{Configuration, Platform, PowerOf2};

use super::arena::REGION_ALIGNMENT;

/// A Configuration with fewer classes than a server one, to keep arenas small.
pub(crate) struct TestConfiguration;

impl Configuration for TestConfiguration {
    const QUANTUM: PowerOf2 = unsafe { PowerOf2::new_unchecked(8) };
    const OPTIMIZE_THRESHOLD: PowerOf2 = unsafe { PowerOf2::new_unchecked(1 << 10) };
    const PRIVATE_SPLIT_SIZE: usize = 256;
    const SHARED_SPLIT_SIZE: usize = 1024;
}

/// A Platform backed by the global allocator, with a manual clock.
///
/// Aborting panics, so that tests can check for it.
#[derive(Default)]
pub(crate) struct TestPlatform {
    now: AtomicU64,
    allocated: AtomicUsize,
    refuse: AtomicBool,
}

impl TestPlatform {
    /// Makes every subsequent allocation fail.
    pub(crate) fn refuse(&self) { self.refuse.store(true, Ordering::Relaxed) }

    /// Advances the clock.
    pub(crate) fn advance(&self, millis: u64) { self.now.fetch_add(millis, Ordering::Relaxed); }

    /// Returns the number of bytes currently allocated.
    pub(crate) fn allocated(&self) -> usize { self.allocated.load(Ordering::Relaxed) }
}

impl Platform for TestPlatform {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if self.refuse.load(Ordering::Relaxed) {
            return None;
        }

        let layout = Layout::from_size_align(layout.size(), layout.align().max(REGION_ALIGNMENT)).ok()?;

        //  Garbage, rather than zeroes, to catch reads of uninitialized fields.
        let pointer = NonNull::new(heap::alloc(layout))?;
        pointer.as_ptr().write_bytes(0xa5, layout.size());

        self.allocated.fetch_add(layout.size(), Ordering::Relaxed);

        Some(pointer)
    }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout) {
        let layout = Layout::from_size_align(layout.size(), layout.align().max(REGION_ALIGNMENT))
            .expect("Valid layout");

        self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);

        heap::dealloc(pointer.as_ptr(), layout);
    }

    fn now_millis(&self) -> u64 { self.now.load(Ordering::Relaxed) }

    fn abort(&self) -> ! { panic!("Aborted") }
}

/// A raw region, for tests of the internals.
pub(crate) struct Region {
    pointer: NonNull<u8>,
    layout: Layout,
}

impl Region {
    pub(crate) fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, REGION_ALIGNMENT).expect("Valid layout");

        //  Safety:
        //  -   `layout` has a non-zero size.
        let pointer = unsafe { heap::alloc(layout) };
        let pointer = NonNull::new(pointer).expect("Allocated");

        unsafe { pointer.as_ptr().write_bytes(0xa5, size) };

        Self { pointer, layout }
    }

    pub(crate) fn pointer(&self) -> NonNull<u8> { self.pointer }

    pub(crate) fn size(&self) -> usize { self.layout.size() }
}

impl Drop for Region {
    fn drop(&mut self) {
        //  Safety:
        //  -   Allocated in `new`, with `layout`.
        unsafe { heap::dealloc(self.pointer.as_ptr(), self.layout) };
    }
}
