//! Shared Heap.
//!
//! A heap used concurrently by every thread of every process mapping its region, typically obtained before forking
//! the workers of a server.
//!
//! Each class has its own lock, and optionally a number of sub-buckets, each with its own lock, to spread contention
//! on the most used classes. A released fragment is only merged with the fragment following it.

use core::{alloc::Layout, fmt, panic::Location, ptr::NonNull};

use alloc::vec::Vec;

use log::debug;

use crate::{
    Audit, Capabilities, ClassStatistics, Configuration, Error, MemoryInfo, Platform, SiteUsage, WarmingPattern,
    WarmingReport,
};
use crate::internals::{
    arena::{Misuse, Site, REGION_ALIGNMENT},
    lock::Locking,
    shared_arena::SharedArena,
    statistics,
    warming,
};

/// Shared Heap.
///
/// The region of the heap is obtained from the `platform` on creation, and returned to it on drop. For the heap to
/// be shared between processes, the platform must provide memory which remains shared across forks.
pub struct SharedHeap<C, P>
    where
        C: Configuration,
        P: Platform,
{
    arena: SharedArena<C>,
    platform: P,
    layout: Layout,
}

impl<C, P> SharedHeap<C, P>
    where
        C: Configuration,
        P: Platform,
{
    /// Returns the minimum size of a heap with `secondary` sub-buckets per class.
    pub fn minimum_size(secondary: usize) -> usize { SharedArena::<C>::minimum_size(secondary) }

    /// Creates a heap of `size` bytes, named `name` in logs and dumps, with `secondary` sub-buckets per class.
    ///
    /// Without sub-buckets, no class can be optimized.
    pub fn new(platform: P, name: &str, size: usize, secondary: usize, capabilities: Capabilities)
        -> Result<Self, Error>
    {
        let needed = Self::minimum_size(secondary);

        if size < needed {
            return Err(Error::ArenaTooSmall { needed, available: size });
        }

        let layout = Layout::from_size_align(size, REGION_ALIGNMENT)
            .map(|layout| layout.pad_to_align())
            .map_err(|_| Error::RegionUnavailable(size))?;

        //  Safety:
        //  -   `layout` has a non-zero size.
        let place = unsafe { platform.allocate(layout) }.ok_or(Error::RegionUnavailable(size))?;

        //  Safety:
        //  -   `place` is exclusively owned, and aligned on REGION_ALIGNMENT.
        match unsafe { SharedArena::initialize(place, size, name, secondary, capabilities) } {
            Ok(arena) => Ok(Self { arena, platform, layout }),
            Err(error) => {
                //  Safety:
                //  -   Allocated just above, with `layout`.
                unsafe { platform.deallocate(place, layout) };
                Err(error)
            },
        }
    }

    /// Returns the name of the heap.
    pub fn name(&self) -> &str { self.arena.arena().name() }

    /// Returns the capabilities of the heap.
    pub fn capabilities(&self) -> Capabilities { self.arena.arena().capabilities() }

    /// Returns the number of sub-buckets per class.
    pub fn secondary(&self) -> usize { self.arena.arena().secondary() }

    /// Returns the platform of the heap.
    pub fn platform(&self) -> &P { &self.platform }

    /// Allocates at least `size` bytes, aligned on the quantum.
    ///
    /// Returns None if the heap is exhausted, after logging its state.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.arena.allocate(size, self.site(), Locking::Locked)
    }

    /// Allocates at least `size` bytes, without locking.
    ///
    /// #   Safety
    ///
    /// -   Assumes that no other thread, or process, uses the heap concurrently.
    #[track_caller]
    pub unsafe fn allocate_unlocked(&self, size: usize) -> Option<NonNull<u8>> {
        self.arena.allocate(size, self.site(), Locking::Unlocked)
    }

    /// Deallocates the memory pointed to by `pointer`.
    ///
    /// Null pointers are ignored. Pointers which do not belong to this heap, or which are already free, are logged
    /// and ignored; the latter aborts through the platform with `debug_tracking`.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `pointer`, if not null, is no longer in use.
    #[track_caller]
    pub unsafe fn deallocate(&self, pointer: *mut u8) { self.deallocate_impl(pointer, self.site(), Locking::Locked) }

    /// Deallocates the memory pointed to by `pointer`, without locking nor merging.
    ///
    /// #   Safety
    ///
    /// -   Same as `deallocate`.
    /// -   Assumes that no other thread, or process, uses the heap concurrently.
    #[track_caller]
    pub unsafe fn deallocate_unlocked(&self, pointer: *mut u8) {
        self.deallocate_impl(pointer, self.site(), Locking::Unlocked)
    }

    /// Resizes the memory pointed to by `pointer` to at least `size` bytes, moving it if necessary.
    ///
    /// A null `pointer` allocates, a `size` of 0 deallocates. Returns None on exhaustion, in which case the original
    /// memory is left untouched.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `pointer`, if not null, was allocated by this heap and is not otherwise in use.
    #[track_caller]
    pub unsafe fn reallocate(&self, pointer: *mut u8, size: usize) -> Option<NonNull<u8>> {
        self.reallocate_impl(pointer, size, self.site(), Locking::Locked)
    }

    /// Resizes the memory pointed to by `pointer`, without locking; it is never grown in place.
    ///
    /// #   Safety
    ///
    /// -   Same as `reallocate`.
    /// -   Assumes that no other thread, or process, uses the heap concurrently.
    #[track_caller]
    pub unsafe fn reallocate_unlocked(&self, pointer: *mut u8, size: usize) -> Option<NonNull<u8>> {
        self.reallocate_impl(pointer, size, self.site(), Locking::Unlocked)
    }

    /// Returns the usable size of the memory pointed to by `pointer`, at least the size requested.
    pub fn size_of(&self, pointer: NonNull<u8>) -> Option<usize> { self.check(self.arena.size_of(pointer)) }

    /// Sets the statistics group of the memory pointed to by `pointer`.
    ///
    /// Returns false, after logging, if `pointer` is not busy.
    pub fn set_tag(&self, pointer: NonNull<u8>, tag: usize) -> bool {
        self.check(self.arena.set_tag(pointer, tag)).is_some()
    }

    /// Returns the statistics group of the memory pointed to by `pointer`.
    pub fn tag(&self, pointer: NonNull<u8>) -> Option<usize> { self.check(self.arena.tag(pointer)) }

    /// Sets the statistics group of all the busy memory, returning the number of fragments tagged.
    ///
    /// Only exact when the heap is quiescent.
    pub fn retag_busy(&self, tag: usize) -> usize { self.arena.retag_busy(tag) }

    /// Returns the usage of the heap.
    ///
    /// With `StatsMode::Lazy`, the free totals are computed at most once per `stats_ttl_ms`, for all processes.
    pub fn info(&self) -> MemoryInfo { self.arena.info(self.platform.now_millis()) }

    /// Writes a human readable summary of the heap, locking one bucket at a time.
    pub fn status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        statistics::write_status(self.arena.arena(), &self.info(), out, Locking::Locked)
    }

    /// Returns the free-list statistics of `class`, if it exists.
    pub fn class_statistics(&self, class: usize) -> Option<ClassStatistics> {
        if class >= self.arena.arena().classes() {
            return None;
        }

        Some(self.arena.class_statistics(class))
    }

    /// Returns the busy fragments grouped by allocation site, largest first; empty without `debug_tracking`.
    ///
    /// Only exact when the heap is quiescent.
    pub fn allocation_sites(&self) -> Vec<SiteUsage> { statistics::allocation_sites(self.arena.arena()) }

    /// Walks every fragment, checking the accounting of the heap.
    ///
    /// Only exact when the heap is quiescent.
    pub fn audit(&self) -> Audit { statistics::audit(self.arena.arena()) }

    /// Spreads the fragments of the linear `class` over its sub-buckets.
    ///
    /// Returns false if the heap has no sub-buckets, or `class` is not linear.
    pub fn optimize_class(&self, class: usize) -> bool { self.arena.optimize_class(class) }

    /// Returns whether `class` is optimized.
    pub fn is_optimized(&self, class: usize) -> bool { self.arena.is_optimized(class) }

    /// Captures the usage of the linear classes so far, as a pattern for warming a later instance.
    pub fn capture_pattern(&self) -> WarmingPattern { warming::capture(&self.arena) }

    /// Pre-fragments the heap according to `pattern`, over `percentage` of its size.
    ///
    /// The `optimized_percentage` of linear classes in highest demand are optimized beforehand.
    ///
    /// Errors if either percentage exceeds 100, or if `pattern` was recorded with a different layout of classes.
    pub fn warm(&mut self, pattern: &WarmingPattern, percentage: u32, optimized_percentage: u32)
        -> Result<WarmingReport, Error>
    {
        warming::replay(&self.arena, pattern, percentage, optimized_percentage)
    }

    //  Internal.
    #[track_caller]
    fn site(&self) -> Option<Site> {
        if self.capabilities().debug_tracking { Some(Location::caller()) } else { None }
    }

    //  Internal.
    unsafe fn deallocate_impl(&self, pointer: *mut u8, site: Option<Site>, locking: Locking) {
        let pointer = match NonNull::new(pointer) {
            Some(pointer) => pointer,
            None => {
                debug!("{}: free of null pointer, ignored", self.name());
                return;
            },
        };

        let result = self.arena.deallocate(pointer, site, locking);
        self.check(result);
    }

    //  Internal.
    unsafe fn reallocate_impl(&self, pointer: *mut u8, size: usize, site: Option<Site>, locking: Locking)
        -> Option<NonNull<u8>>
    {
        let result = self.arena.reallocate(NonNull::new(pointer), size, site, locking);

        self.check(result).flatten()
    }

    //  Internal.
    fn check<T>(&self, result: Result<T, Misuse>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(misuse) => {
                misuse.report(self.name(), self.capabilities(), &self.platform);
                None
            },
        }
    }
}

impl<C, P> Drop for SharedHeap<C, P>
    where
        C: Configuration,
        P: Platform,
{
    fn drop(&mut self) {
        let place = self.arena.arena().base();

        //  Safety:
        //  -   Allocated in `new`, with `layout`.
        unsafe { self.platform.deallocate(place, self.layout) };
    }
}

//  Safety:
//  -   All state within the region is either immutable after creation, atomic, or protected by the bucket locks.
unsafe impl<C, P> Send for SharedHeap<C, P>
    where
        C: Configuration,
        P: Platform + Send,
{}

//  Safety:
//  -   All state within the region is either immutable after creation, atomic, or protected by the bucket locks.
unsafe impl<C, P> Sync for SharedHeap<C, P>
    where
        C: Configuration,
        P: Platform + Sync,
{}
