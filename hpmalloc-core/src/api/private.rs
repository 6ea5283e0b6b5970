//! Private Heap.
//!
//! A heap owned by a single thread of a single process, typically holding the per-process data of a worker.
//!
//! Released fragments are merged with all their free neighbours, so that a private heap never holds two adjacent free
//! fragments.

use core::{alloc::Layout, fmt, panic::Location, ptr::NonNull};

use alloc::vec::Vec;

use log::debug;

use crate::{Audit, Capabilities, ClassStatistics, Configuration, Error, MemoryInfo, Platform, SiteUsage};
use crate::internals::{
    arena::{Arena, Misuse, Site, REGION_ALIGNMENT},
    lock::Locking,
    private_arena::PrivateArena,
    statistics,
};

/// Private Heap.
///
/// The region of the heap is obtained from the `platform` on creation, and returned to it on drop.
pub struct PrivateHeap<C, P>
    where
        C: Configuration,
        P: Platform,
{
    arena: PrivateArena<C>,
    platform: P,
    layout: Layout,
}

impl<C, P> PrivateHeap<C, P>
    where
        C: Configuration,
        P: Platform,
{
    /// Returns the minimum size of a heap.
    pub fn minimum_size() -> usize { Arena::<C>::minimum_size(0) }

    /// Creates a heap of `size` bytes, named `name` in logs and dumps.
    ///
    /// The name is truncated to 32 bytes.
    pub fn new(platform: P, name: &str, size: usize, capabilities: Capabilities) -> Result<Self, Error> {
        let needed = Self::minimum_size();

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
        match unsafe { PrivateArena::initialize(place, size, name, capabilities) } {
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

    /// Returns the platform of the heap.
    pub fn platform(&self) -> &P { &self.platform }

    /// Allocates at least `size` bytes, aligned on the quantum.
    ///
    /// Returns None if the heap is exhausted, after logging its state.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let site = self.site();

        self.arena.allocate(size, site)
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
    pub unsafe fn deallocate(&mut self, pointer: *mut u8) {
        let pointer = match NonNull::new(pointer) {
            Some(pointer) => pointer,
            None => {
                debug!("{}: free of null pointer, ignored", self.name());
                return;
            },
        };

        let site = self.site();

        if let Err(misuse) = self.arena.deallocate(pointer, site) {
            self.report(misuse);
        }
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
    pub unsafe fn reallocate(&mut self, pointer: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let site = self.site();

        match self.arena.reallocate(NonNull::new(pointer), size, site) {
            Ok(result) => result,
            Err(misuse) => {
                self.report(misuse);
                None
            },
        }
    }

    /// Returns the usable size of the memory pointed to by `pointer`, at least the size requested.
    pub fn size_of(&self, pointer: NonNull<u8>) -> Option<usize> {
        match self.arena.size_of(pointer) {
            Ok(size) => Some(size),
            Err(misuse) => {
                self.report(misuse);
                None
            },
        }
    }

    /// Returns the usage of the heap.
    pub fn info(&self) -> MemoryInfo {
        let arena = self.arena.arena();

        statistics::memory_info(arena, statistics::free_totals(arena, Locking::Unlocked))
    }

    /// Writes a human readable summary of the heap.
    pub fn status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        statistics::write_status(self.arena.arena(), &self.info(), out, Locking::Unlocked)
    }

    /// Returns the free-list statistics of `class`, if it exists.
    pub fn class_statistics(&self, class: usize) -> Option<ClassStatistics> {
        let arena = self.arena.arena();

        if class >= arena.classes() {
            return None;
        }

        Some(statistics::class_statistics(arena, class, Locking::Unlocked))
    }

    /// Returns the busy fragments grouped by allocation site, largest first; empty without `debug_tracking`.
    pub fn allocation_sites(&self) -> Vec<SiteUsage> { statistics::allocation_sites(self.arena.arena()) }

    /// Walks every fragment, checking the accounting of the heap.
    pub fn audit(&self) -> Audit { statistics::audit(self.arena.arena()) }

    //  Internal.
    #[track_caller]
    fn site(&self) -> Option<Site> {
        if self.capabilities().debug_tracking { Some(Location::caller()) } else { None }
    }

    //  Internal.
    fn report(&self, misuse: Misuse) {
        misuse.report(self.name(), self.capabilities(), &self.platform);
    }
}

impl<C, P> Drop for PrivateHeap<C, P>
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
//  -   The region is exclusively owned, and only accessed through `&mut self` for mutations.
unsafe impl<C, P> Send for PrivateHeap<C, P>
    where
        C: Configuration,
        P: Platform + Send,
{}

//  Safety:
//  -   Methods taking `&self` only read the region, through atomics.
unsafe impl<C, P> Sync for PrivateHeap<C, P>
    where
        C: Configuration,
        P: Platform + Sync,
{}
