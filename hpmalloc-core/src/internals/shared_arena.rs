//! Shared Arena
//!
//! An arena used concurrently by multiple threads, and by multiple processes mapping the same region.
//!
//! Every bucket has its own lock. Outside of locking a whole class, which acquires the primary bucket and then its
//! sub-buckets in order, no caller ever holds more than one bucket lock at a time.
//!
//! A released fragment is only merged with its immediately following neighbour. The neighbour is checked without
//! locking, then re-checked under the lock of its bucket, and the merge is abandoned if it changed in between.
//!
//! The arena allocates its own statistics blocks, the lazy cache and the per-class usage counters, from itself at
//! start-up, through the unlocked path.

use core::{
    cmp, mem,
    ptr::{self, NonNull},
    slice,
    sync::atomic::{AtomicUsize, Ordering},
};

use alloc::vec::Vec;

use crate::{Capabilities, ClassStatistics, Configuration, Error, MemoryInfo, Properties, StatsMode};

use super::arena::{Arena, Misuse, Site};
use super::atomic::Offset;
use super::lock::Locking;
use super::statistics::{self, FreeTotals, LazyCache};

//  Number of additional scans, when an allocation fails despite plenty of free memory.
const MAXIMUM_RESCANS: usize = 10;

//  Free memory, in multiples of the request, above which an allocation failure is likely a race.
const RESCAN_FACTOR: usize = 20;

pub(crate) struct SharedArena<C> {
    arena: Arena<C>,
}

impl<C> SharedArena<C>
    where
        C: Configuration,
{
    /// Returns the minimum size of a shared arena with `secondary` sub-buckets per class.
    pub(crate) fn minimum_size(secondary: usize) -> usize {
        let blocks = Self::round_up(mem::size_of::<LazyCache>()) + Self::round_up(Self::usage_size());

        Arena::<C>::minimum_size(secondary) + blocks + 2 * Self::minimum_split()
    }

    /// In-place constructs a SharedArena, and its statistics blocks.
    ///
    /// #   Safety
    ///
    /// -   Same as `Arena::initialize`.
    pub(crate) unsafe fn initialize(
        place: NonNull<u8>,
        size: usize,
        name: &str,
        secondary: usize,
        capabilities: Capabilities,
    )
        -> Result<Self, Error>
    {
        let needed = Self::minimum_size(secondary);

        if size < needed {
            return Err(Error::ArenaTooSmall { needed, available: size });
        }

        let arena = Arena::initialize(place, size, name, secondary, capabilities)?;
        let result = Self { arena };

        result.prepare_statistics()
            .ok_or(Error::ArenaTooSmall { needed, available: size })?;

        Ok(result)
    }

    pub(crate) fn arena(&self) -> &Arena<C> { &self.arena }

    /// Allocates a fragment of at least `size` bytes.
    pub(crate) fn allocate(&self, size: usize, site: Option<Site>, locking: Locking) -> Option<NonNull<u8>> {
        let wanted = match Properties::<C>::round_up(size) {
            Some(wanted) => wanted,
            None => {
                self.arena.report_exhaustion(size);
                return None;
            },
        };

        let class = Properties::<C>::class_of_size(wanted);
        self.record_usage(class);

        let mut rescans = 0;

        loop {
            if let Some(offset) = self.take(class, wanted, locking) {
                if let Some(rest) = self.arena.split(offset, wanted, Self::minimum_split()) {
                    self.put(rest, locking);
                }

                return Some(self.arena.hand_out(offset, site));
            }

            //  Another thread may have detached the fragment, in the midst of splitting or merging it.
            if locking == Locking::Unlocked || rescans == MAXIMUM_RESCANS || !self.is_worth_rescanning(wanted) {
                break;
            }

            rescans += 1;
        }

        self.arena.report_exhaustion(size);
        None
    }

    /// Releases the fragment whose payload starts at `pointer`.
    ///
    /// Unlocked, the fragment is not merged.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `pointer` was returned by this arena, and that its payload is no longer in use.
    pub(crate) unsafe fn deallocate(&self, pointer: NonNull<u8>, site: Option<Site>, locking: Locking)
        -> Result<(), Misuse>
    {
        let offset = self.arena.busy_offset_of(pointer)?;
        let fragment = self.arena.fragment(offset);

        self.arena.account_deallocation(fragment.size());
        fragment.set_tag(0);
        fragment.set_site(site);

        self.release(offset, locking);

        Ok(())
    }

    /// Resizes the fragment whose payload starts at `pointer`, moving it if necessary.
    ///
    /// Unlocked, the fragment is never grown in place.
    ///
    /// #   Safety
    ///
    /// -   Same as `deallocate`, if `pointer` is not None.
    pub(crate) unsafe fn reallocate(
        &self,
        pointer: Option<NonNull<u8>>,
        size: usize,
        site: Option<Site>,
        locking: Locking,
    )
        -> Result<Option<NonNull<u8>>, Misuse>
    {
        let pointer = match pointer {
            Some(pointer) => pointer,
            None => return Ok(self.allocate(size, site, locking)),
        };

        if size == 0 {
            self.deallocate(pointer, site, locking)?;
            return Ok(None);
        }

        let offset = self.arena.busy_offset_of(pointer)?;
        let old = self.arena.fragment(offset).size();

        let wanted = match Properties::<C>::round_up(size) {
            Some(wanted) => wanted,
            None => {
                self.arena.report_exhaustion(size);
                return Ok(None);
            },
        };

        if wanted <= old {
            self.shrink(offset, wanted, locking);
            return Ok(Some(pointer));
        }

        if locking == Locking::Locked && self.grow(offset, wanted) {
            return Ok(Some(pointer));
        }

        let moved = match self.allocate(size, site, locking) {
            Some(moved) => moved,
            None => return Ok(None),
        };

        //  Safety:
        //  -   Both fragments are busy, hence distinct, and at least `old` bytes.
        ptr::copy_nonoverlapping(pointer.as_ptr(), moved.as_ptr(), old);

        self.deallocate(pointer, site, locking)?;

        Ok(Some(moved))
    }

    /// Returns the usable size of the busy fragment whose payload starts at `pointer`.
    pub(crate) fn size_of(&self, pointer: NonNull<u8>) -> Result<usize, Misuse> {
        self.arena.busy_offset_of(pointer).map(|offset| self.arena.fragment(offset).size())
    }

    /// Sets the statistics group of the busy fragment whose payload starts at `pointer`.
    pub(crate) fn set_tag(&self, pointer: NonNull<u8>, tag: usize) -> Result<(), Misuse> {
        self.arena.busy_offset_of(pointer).map(|offset| self.arena.fragment(offset).set_tag(tag))
    }

    /// Returns the statistics group of the busy fragment whose payload starts at `pointer`.
    pub(crate) fn tag(&self, pointer: NonNull<u8>) -> Result<usize, Misuse> {
        self.arena.busy_offset_of(pointer).map(|offset| self.arena.fragment(offset).tag())
    }

    /// Sets the statistics group of every busy fragment, returning their number.
    pub(crate) fn retag_busy(&self, tag: usize) -> usize {
        self.arena.walk()
            .map(|offset| self.arena.fragment(offset))
            .filter(|fragment| !fragment.is_free())
            .map(|fragment| fragment.set_tag(tag))
            .count()
    }

    /// Spreads the fragments of `class` over its sub-buckets, from now on.
    ///
    /// Returns false if the class cannot be optimized: there are no sub-buckets, or the class is not linear.
    pub(crate) fn optimize_class(&self, class: usize) -> bool {
        let secondary = self.arena.secondary();

        if secondary == 0 || class == 0 || !Properties::<C>::is_linear(class) {
            return false;
        }

        let _guard = ClassGuard::new(&self.arena, class);

        let primary = self.arena.bucket(class);

        if primary.is_optimized() {
            return true;
        }

        primary.set_optimized();

        while let Some(offset) = primary.head() {
            self.arena.detach(offset);
            self.arena.attach(offset, self.arena.sub_bucket(class, primary.next_put(secondary)));
        }

        true
    }

    /// Returns whether `class` is optimized.
    pub(crate) fn is_optimized(&self, class: usize) -> bool {
        class < self.arena.classes() && self.arena.bucket(class).is_optimized()
    }

    /// Returns the free-list statistics of `class`, with the whole class locked.
    pub(crate) fn class_statistics(&self, class: usize) -> ClassStatistics {
        let _guard = ClassGuard::new(&self.arena, class);

        statistics::class_statistics(&self.arena, class, Locking::Unlocked)
    }

    /// Returns the usage of the arena; lazily computed free totals are reused until they expire.
    pub(crate) fn info(&self, now: u64) -> MemoryInfo {
        statistics::memory_info(&self.arena, self.free_totals(now))
    }

    /// Returns the number of allocations requested so far, for each linear class.
    pub(crate) fn usage_counts(&self) -> Vec<usize> {
        match self.usage() {
            Some(usage) => usage.iter().map(|count| count.load(Ordering::Relaxed)).collect(),
            None => Vec::new(),
        }
    }

    /// Attaches the detached fragment at `offset` to the bucket its class releases into.
    pub(crate) fn put(&self, offset: Offset, locking: Locking) {
        let class = Properties::<C>::class_of_size(self.arena.fragment(offset).size());
        let index = self.arena.put_bucket(class);

        let _guard = locking.guard(self.arena.bucket(index).raw_lock());

        self.arena.attach(offset, index);
    }

    //  Internal.
    fn minimum_split() -> usize {
        cmp::max(C::SHARED_SPLIT_SIZE, Arena::<C>::overhead() + C::QUANTUM.value())
    }

    //  Internal.
    fn usage_size() -> usize { (Properties::<C>::linear_classes() + 1) * mem::size_of::<AtomicUsize>() }

    //  Internal.
    fn round_up(size: usize) -> usize { C::QUANTUM.round_down(size + C::QUANTUM.value() - 1) }

    //  Internal: allocates the statistics blocks, before any other allocation.
    fn prepare_statistics(&self) -> Option<()> {
        let cache = self.allocate(mem::size_of::<LazyCache>(), None, Locking::Unlocked)?;
        let usage = self.allocate(Self::usage_size(), None, Locking::Unlocked)?;

        //  Safety:
        //  -   Both blocks are busy, sufficiently sized, and aligned on the quantum.
        unsafe {
            ptr::write(cache.as_ptr() as *mut LazyCache, LazyCache::default());
            ptr::write_bytes(usage.as_ptr(), 0, Self::usage_size());
        }

        self.arena.publish_statistics(self.arena.offset_of(cache), self.arena.offset_of(usage));

        Some(())
    }

    //  Internal.
    fn lazy_cache(&self) -> Option<&LazyCache> {
        let offset = self.arena.header().statistics()?;

        //  Safety:
        //  -   Initialized in `prepare_statistics`, and never released.
        Some(unsafe { &*(self.arena.payload(offset).as_ptr() as *const LazyCache) })
    }

    //  Internal.
    fn usage(&self) -> Option<&[AtomicUsize]> {
        let offset = self.arena.header().usage()?;
        let pointer = self.arena.payload(offset).as_ptr() as *const AtomicUsize;

        //  Safety:
        //  -   Initialized in `prepare_statistics`, and never released.
        Some(unsafe { slice::from_raw_parts(pointer, Properties::<C>::linear_classes() + 1) })
    }

    //  Internal.
    fn record_usage(&self, class: usize) {
        if !self.arena.header().statistics_ready() {
            return;
        }

        if let Some(count) = self.usage().and_then(|usage| usage.get(class)) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    //  Internal.
    fn free_totals(&self, now: u64) -> FreeTotals {
        let capabilities = self.arena.capabilities();

        if capabilities.stats == StatsMode::Fast {
            return statistics::free_totals(&self.arena, Locking::Locked);
        }

        let cache = match self.lazy_cache() {
            Some(cache) => cache,
            None => return statistics::free_totals(&self.arena, Locking::Locked),
        };

        if let Some(totals) = cache.get(now, capabilities.stats_ttl_ms) {
            return totals;
        }

        let totals = statistics::free_totals(&self.arena, Locking::Locked);
        cache.set(now, totals);

        totals
    }

    //  Internal.
    fn is_worth_rescanning(&self, wanted: usize) -> bool {
        let available = self.arena.size().saturating_sub(self.arena.header().real_used());

        available > wanted.saturating_mul(RESCAN_FACTOR)
    }

    //  Internal: finds and detaches a fragment of at least `wanted` bytes, starting from `class`.
    fn take(&self, class: usize, wanted: usize, locking: Locking) -> Option<Offset> {
        let secondary = self.arena.secondary();

        let start = if self.is_optimized(class) {
            let cursor = self.arena.bucket(class).next_get(secondary);

            for j in 0..secondary {
                let index = self.arena.sub_bucket(class, (cursor + j) % secondary);

                if let Some(offset) = self.take_from(index, wanted, locking) {
                    return Some(offset);
                }
            }

            //  Fragments released while the class was being optimized.
            if let Some(offset) = self.take_from(class, wanted, locking) {
                return Some(offset);
            }

            class + 1
        } else {
            class
        };

        for index in start..self.arena.classes() {
            if let Some(offset) = self.take_from(index, wanted, locking) {
                return Some(offset);
            }

            if !self.is_optimized(index) {
                continue;
            }

            for j in 0..secondary {
                if let Some(offset) = self.take_from(self.arena.sub_bucket(index, j), wanted, locking) {
                    return Some(offset);
                }
            }
        }

        None
    }

    //  Internal: detaches the first fit of the bucket at `index`, if any.
    fn take_from(&self, index: usize, wanted: usize, locking: Locking) -> Option<Offset> {
        let bucket = self.arena.bucket(index);

        if bucket.head().is_none() {
            return None;
        }

        let _guard = locking.guard(bucket.raw_lock());

        let offset = self.arena.find_fit(index, wanted)?;
        self.arena.detach(offset);

        Some(offset)
    }

    //  Internal: shrinks the busy fragment at `offset` in place.
    fn shrink(&self, offset: Offset, wanted: usize, locking: Locking) {
        let old = self.arena.fragment(offset).size();

        if let Some(rest) = self.arena.split(offset, wanted, Self::minimum_split()) {
            self.arena.account_deallocation(old);
            self.arena.account_allocation(wanted);

            self.release(rest, locking);
        }
    }

    //  Internal: grows the busy fragment at `offset` in place, if its following neighbour is free and large enough.
    fn grow(&self, offset: Offset, wanted: usize) -> bool {
        let fragment = self.arena.fragment(offset);
        let old = fragment.size();

        if !self.merge_next(offset, wanted - old) {
            return false;
        }

        self.arena.account_deallocation(old);

        if let Some(rest) = self.arena.split(offset, wanted, Self::minimum_split()) {
            self.release(rest, Locking::Locked);
        }

        self.arena.account_allocation(fragment.size());

        true
    }

    //  Internal: merges the following neighbour, if any, then attaches the detached fragment at `offset`.
    fn release(&self, offset: Offset, locking: Locking) {
        if locking == Locking::Locked {
            self.merge_next(offset, 0);
        }

        self.put(offset, locking);
    }

    //  Internal: merges the following neighbour into the detached fragment at `offset`, if free and providing at
    //  least `needed` bytes, headers included.
    fn merge_next(&self, offset: Offset, needed: usize) -> bool {
        let next = self.arena.next_phys(offset);
        let neighbour = self.arena.fragment(next);

        //  Unlocked peek; the sentinel is never attached.
        let index = match neighbour.bucket() {
            Some(index) if index < self.arena.bucket_count() => index,
            _ => return false,
        };

        let seen = neighbour.size();

        if seen + Arena::<C>::overhead() < needed {
            return false;
        }

        {
            let _guard = self.arena.bucket(index).lock();

            if neighbour.bucket() != Some(index) || neighbour.size() != seen {
                return false;
            }

            self.arena.detach(next);
        }

        self.arena.absorb(offset, next);

        true
    }
}

//  Holds the locks of all the buckets of a class.
struct ClassGuard<'a, C>
    where
        C: Configuration,
{
    arena: &'a Arena<C>,
    class: usize,
}

impl<'a, C> ClassGuard<'a, C>
    where
        C: Configuration,
{
    fn new(arena: &'a Arena<C>, class: usize) -> Self {
        for index in arena.buckets_of_class(class) {
            arena.bucket(index).raw_lock().acquire();
        }

        Self { arena, class }
    }
}

impl<'a, C> Drop for ClassGuard<'a, C>
    where
        C: Configuration,
{
    fn drop(&mut self) {
        for index in self.arena.buckets_of_class(self.class) {
            //  Safety:
            //  -   Acquired in `new`.
            unsafe { self.arena.bucket(index).raw_lock().release() };
        }
    }
}
