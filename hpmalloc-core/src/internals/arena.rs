//! Arena
//!
//! An Arena is a contiguous region, laid out as:
//!
//! -   A Header, with the immutable layout of the arena and its usage counters.
//! -   The buckets: one primary bucket per class, followed by `secondary` sub-buckets per class.
//! -   The fragments, from the first one, immediately after the buckets, to the sentinel, at the very end.
//!
//! The sentinel is a fragment of size 0 which is never free, and therefore never merged nor handed out.
//!
//! The Arena only provides the primitives manipulating fragments and free lists; it is up to the caller to hold the
//! appropriate locks, if any.

use core::{
    marker::PhantomData,
    mem,
    panic::Location,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, error};

use crate::{Capabilities, Configuration, Error, Platform, Properties, StatsMode};
use crate::utils;

use super::atomic::{AtomicOffset, Counter, Offset};
use super::bucket::Bucket;
use super::fragment::Fragment;

/// Site of an allocation, or deallocation.
pub(crate) type Site = &'static Location<'static>;

/// Alignment of the regions requested from the platform.
pub(crate) const REGION_ALIGNMENT: usize = 4096;

#[repr(C)]
pub(crate) struct Header {
    //  Immutable after initialization.
    size: usize,
    name: [u8; 32],
    classes: usize,
    secondary: usize,
    first: usize,
    sentinel: usize,
    init_overhead: usize,
    //  Usage counters.
    used: Counter,
    real_used: Counter,
    max_real_used: Counter,
    fragments: Counter,
    //  Blocks allocated from the arena itself, set once at start-up.
    statistics_ready: AtomicBool,
    statistics: AtomicOffset,
    usage: AtomicOffset,
}

impl Header {
    pub(crate) fn used(&self) -> usize { self.used.load() }

    pub(crate) fn real_used(&self) -> usize { self.real_used.load() }

    pub(crate) fn max_real_used(&self) -> usize { self.max_real_used.load() }

    pub(crate) fn fragments(&self) -> usize { self.fragments.load() }

    pub(crate) fn statistics_ready(&self) -> bool { self.statistics_ready.load(Ordering::Acquire) }

    pub(crate) fn statistics(&self) -> Option<Offset> { self.statistics.load() }

    pub(crate) fn usage(&self) -> Option<Offset> { self.usage.load() }
}

pub(crate) struct Arena<C> {
    base: NonNull<u8>,
    capabilities: Capabilities,
    _configuration: PhantomData<C>,
}

impl<C> Arena<C>
    where
        C: Configuration,
{
    /// Returns the number of bytes of the header of each fragment.
    pub(crate) fn overhead() -> usize { Self::round_up(mem::size_of::<Fragment>()) }

    /// Returns the minimum size of an arena with `secondary` sub-buckets per class.
    pub(crate) fn minimum_size(secondary: usize) -> usize {
        Self::control_size(secondary) + 2 * Self::overhead() + C::QUANTUM.value()
    }

    /// In-place constructs an Arena, with a single free fragment.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `place` points to at least `size` writable bytes, exclusively owned by the caller.
    /// -   Assumes that `place` is sufficiently aligned for a `Header`, and the quantum.
    pub(crate) unsafe fn initialize(
        place: NonNull<u8>,
        size: usize,
        name: &str,
        secondary: usize,
        capabilities: Capabilities,
    )
        -> Result<Self, Error>
    {
        assert!(C::QUANTUM.value() >= mem::align_of::<Fragment>(),
            "Quantum {} is below the alignment of a fragment header", C::QUANTUM.value());
        debug_assert!(place.as_ptr() as usize % C::QUANTUM == 0);
        debug_assert!(place.as_ptr() as usize % mem::align_of::<Header>() == 0);

        let needed = Self::minimum_size(secondary);
        let size = C::QUANTUM.round_down(size);

        if size < needed {
            return Err(Error::ArenaTooSmall { needed, available: size });
        }

        let overhead = Self::overhead();
        let classes = Properties::<C>::number_classes();
        let first = Self::control_size(secondary);
        let sentinel = size - overhead;

        let mut header = Header {
            size,
            name: [0; 32],
            classes,
            secondary,
            first,
            sentinel,
            init_overhead: first + overhead,
            used: Counter::new(0),
            real_used: Counter::new(first + overhead),
            max_real_used: Counter::new(first + overhead),
            fragments: Counter::new(1),
            statistics_ready: AtomicBool::new(false),
            statistics: AtomicOffset::default(),
            usage: AtomicOffset::default(),
        };

        utils::copy_name(name, &mut header.name);

        //  Safety:
        //  -   `place` is assumed to be sufficiently sized, and aligned.
        ptr::write(place.as_ptr() as *mut Header, header);

        let buckets = place.as_ptr().add(mem::size_of::<Header>()) as *mut Bucket;

        for index in 0..classes * (1 + secondary) {
            ptr::write(buckets.add(index), Bucket::default());
        }

        let result = Self { base: place, capabilities, _configuration: PhantomData };

        let first = Offset::new(first).expect("Non-zero: after the header");
        let sentinel = Offset::new(sentinel).expect("Non-zero: after the header");

        ptr::write(result.fragment_ptr(first), Fragment::new(sentinel.value() - first.value() - overhead, None));
        ptr::write(result.fragment_ptr(sentinel), Fragment::new(0, Some(first)));

        let fragment_size = result.fragment(first).size();
        result.attach(first, Properties::<C>::class_of_size(fragment_size));

        debug!("{}: initialized {} bytes at {:p}, {} classes, {} sub-buckets per class, first fragment of {} bytes",
            result.name(), size, place, classes, secondary, fragment_size);

        Ok(result)
    }

    /// Returns the start of the region.
    pub(crate) fn base(&self) -> NonNull<u8> { self.base }

    pub(crate) fn capabilities(&self) -> Capabilities { self.capabilities }

    pub(crate) fn header(&self) -> &Header {
        //  Safety:
        //  -   Initialized in `initialize`.
        unsafe { &*(self.base.as_ptr() as *const Header) }
    }

    pub(crate) fn name(&self) -> &str { utils::read_name(&self.header().name) }

    pub(crate) fn size(&self) -> usize { self.header().size }

    pub(crate) fn init_overhead(&self) -> usize { self.header().init_overhead }

    pub(crate) fn classes(&self) -> usize { self.header().classes }

    pub(crate) fn secondary(&self) -> usize { self.header().secondary }

    pub(crate) fn bucket_count(&self) -> usize { self.classes() * (1 + self.secondary()) }

    pub(crate) fn bucket(&self, index: usize) -> &Bucket {
        debug_assert!(index < self.bucket_count(), "{} >= {}", index, self.bucket_count());

        //  Safety:
        //  -   Initialized in `initialize`, and within bounds.
        unsafe {
            let buckets = self.base.as_ptr().add(mem::size_of::<Header>()) as *const Bucket;
            &*buckets.add(index)
        }
    }

    /// Returns the index of the `j`th sub-bucket of `class`.
    pub(crate) fn sub_bucket(&self, class: usize, j: usize) -> usize {
        debug_assert!(j < self.secondary());

        self.classes() + class * self.secondary() + j
    }

    /// Returns the primary bucket of `class`, followed by its sub-buckets.
    pub(crate) fn buckets_of_class(&self, class: usize) -> impl Iterator<Item = usize> + '_ {
        (0..=self.secondary()).map(move |j| if j == 0 { class } else { self.sub_bucket(class, j - 1) })
    }

    /// Returns the bucket in which to release a fragment of `class`.
    pub(crate) fn put_bucket(&self, class: usize) -> usize {
        let bucket = self.bucket(class);

        if self.secondary() > 0 && bucket.is_optimized() {
            self.sub_bucket(class, bucket.next_put(self.secondary()))
        } else {
            class
        }
    }

    pub(crate) fn first(&self) -> Offset { Offset::new(self.header().first).expect("Non-zero: after the header") }

    pub(crate) fn sentinel(&self) -> Offset {
        Offset::new(self.header().sentinel).expect("Non-zero: after the header")
    }

    pub(crate) fn fragment(&self, offset: Offset) -> &Fragment {
        debug_assert!(offset.value() <= self.header().sentinel, "{} out of bounds", offset.value());

        //  Safety:
        //  -   All offsets handed out point to fragment headers, within bounds.
        unsafe { &*self.fragment_ptr(offset) }
    }

    /// Returns the fragment physically following the fragment at `offset`.
    pub(crate) fn next_phys(&self, offset: Offset) -> Offset {
        offset.add(Self::overhead() + self.fragment(offset).size())
    }

    /// Returns a pointer to the payload of the fragment at `offset`.
    pub(crate) fn payload(&self, offset: Offset) -> NonNull<u8> { self.at(offset.add(Self::overhead())) }

    /// Returns a pointer to an arbitrary offset within the arena.
    pub(crate) fn at(&self, offset: Offset) -> NonNull<u8> {
        debug_assert!(offset.value() < self.size());

        //  Safety:
        //  -   Within bounds, hence not null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset.value())) }
    }

    /// Returns the offset of the fragment whose payload starts at `pointer`, if it plausibly does.
    pub(crate) fn offset_of(&self, pointer: NonNull<u8>) -> Option<Offset> {
        let address = pointer.as_ptr() as usize;
        let offset = address.checked_sub(self.base.as_ptr() as usize)?.checked_sub(Self::overhead())?;

        let header = self.header();

        if offset < header.first || offset >= header.sentinel || offset % C::QUANTUM != 0 {
            return None;
        }

        Offset::new(offset)
    }

    /// Returns the offset of the busy fragment whose payload starts at `pointer`.
    ///
    /// The header is checked against its physical successor before being trusted, so that a pointer within a payload
    /// is reported as foreign rather than read as a header.
    pub(crate) fn busy_offset_of(&self, pointer: NonNull<u8>) -> Result<Offset, Misuse> {
        let offset = self.offset_of(pointer).ok_or(Misuse::Foreign(pointer))?;
        let fragment = self.fragment(offset);

        if fragment.is_merged() {
            return Err(Misuse::AlreadyFree { pointer, site: None });
        }

        if !self.is_linked(offset) {
            return Err(Misuse::Foreign(pointer));
        }

        if fragment.is_free() {
            return Err(Misuse::AlreadyFree { pointer, site: fragment.site() });
        }

        Ok(offset)
    }

    //  Internal: whether the header at `offset` is well-formed, and its physical successor links back to it.
    fn is_linked(&self, offset: Offset) -> bool {
        let header = self.header();
        let fragment = self.fragment(offset);
        let size = fragment.size();

        if size == 0 || size % C::QUANTUM != 0 || !fragment.has_valid_bucket(self.bucket_count()) {
            return false;
        }

        let next = offset.value().checked_add(Self::overhead()).and_then(|n| n.checked_add(size));

        match next.and_then(Offset::new) {
            Some(next) if next.value() <= header.sentinel => self.fragment(next).prev_phys() == Some(offset),
            _ => false,
        }
    }

    /// Attaches the detached fragment at `offset` to the bucket at `index`.
    pub(crate) fn attach(&self, offset: Offset, index: usize) {
        let fragment = self.fragment(offset);
        debug_assert!(!fragment.is_free());

        let bucket = self.bucket(index);
        let size = fragment.size();

        //  Exponential classes are kept sorted by increasing size, so that the first fit is the best fit.
        let (prev, next) = if self.is_sorted(index) {
            let mut prev = None;
            let mut next = bucket.head();

            while let Some(current) = next {
                if self.fragment(current).size() >= size {
                    break;
                }

                prev = Some(current);
                next = self.fragment(current).next_free();
            }

            (prev, next)
        } else {
            (None, bucket.head())
        };

        fragment.set_prev_free(prev);
        fragment.set_next_free(next);

        match prev {
            Some(prev) => self.fragment(prev).set_next_free(Some(offset)),
            None => bucket.set_head(Some(offset)),
        }

        if let Some(next) = next {
            self.fragment(next).set_prev_free(Some(offset));
        }

        fragment.set_bucket(Some(index));

        if self.capabilities.stats == StatsMode::Fast {
            bucket.record_attach(size);
        }
    }

    /// Detaches the fragment at `offset` from its bucket.
    pub(crate) fn detach(&self, offset: Offset) {
        let fragment = self.fragment(offset);

        let index = match fragment.bucket() {
            Some(index) => index,
            None => {
                debug_assert!(false, "Detaching a detached fragment at {}", offset.value());
                return;
            },
        };

        let bucket = self.bucket(index);
        let (prev, next) = (fragment.prev_free(), fragment.next_free());

        match prev {
            Some(prev) => self.fragment(prev).set_next_free(next),
            None => bucket.set_head(next),
        }

        if let Some(next) = next {
            self.fragment(next).set_prev_free(prev);
        }

        fragment.set_prev_free(None);
        fragment.set_next_free(None);
        fragment.set_bucket(None);

        if self.capabilities.stats == StatsMode::Fast {
            bucket.record_detach(fragment.size());
        }
    }

    /// Returns the first fragment of the bucket at `index` which is at least `wanted` bytes.
    pub(crate) fn find_fit(&self, index: usize, wanted: usize) -> Option<Offset> {
        self.free_list(index).find(|offset| self.fragment(*offset).size() >= wanted)
    }

    /// Iterates over the free fragments of the bucket at `index`.
    pub(crate) fn free_list(&self, index: usize) -> FreeList<'_, C> {
        //  A free list cannot be longer than this, unless corrupted.
        let limit = self.size() / Self::overhead();

        FreeList { arena: self, next: self.bucket(index).head(), limit }
    }

    /// Iterates over all the fragments, in physical order, the sentinel excluded.
    pub(crate) fn walk(&self) -> Walk<'_, C> { Walk { arena: self, next: Some(self.first()), complete: false } }

    /// Splits the detached fragment at `offset` in 2, if the leftover is at least `minimum` bytes.
    ///
    /// Returns the detached leftover, if split.
    pub(crate) fn split(&self, offset: Offset, wanted: usize, minimum: usize) -> Option<Offset> {
        debug_assert!(minimum >= Self::overhead() + C::QUANTUM.value());

        let size = self.fragment(offset).size();

        if size < wanted || size - wanted < minimum {
            return None;
        }

        Some(self.split_at(offset, wanted))
    }

    /// Splits the detached fragment at `offset` in a fragment of `wanted` bytes, and a detached leftover.
    pub(crate) fn split_at(&self, offset: Offset, wanted: usize) -> Offset {
        let overhead = Self::overhead();
        let fragment = self.fragment(offset);
        let size = fragment.size();

        debug_assert!(!fragment.is_free());
        debug_assert!(size >= wanted + overhead + C::QUANTUM.value(), "{} too small for {}", size, wanted);

        let rest = offset.add(overhead + wanted);

        //  Safety:
        //  -   `rest` lies within the payload of `fragment`, which is exclusively owned.
        unsafe { ptr::write(self.fragment_ptr(rest), Fragment::new(size - wanted - overhead, Some(offset))) };

        fragment.set_size(wanted);

        self.fragment(self.next_phys(rest)).set_prev_phys(Some(rest));
        self.header().fragments.add(1);

        rest
    }

    /// Merges the detached fragment at `next` into the fragment at `offset`, which it immediately follows.
    pub(crate) fn absorb(&self, offset: Offset, next: Offset) {
        debug_assert_eq!(next, self.next_phys(offset));
        debug_assert!(!self.fragment(next).is_free());

        let fragment = self.fragment(offset);
        let absorbed = self.fragment(next);

        fragment.set_size(fragment.size() + Self::overhead() + absorbed.size());
        absorbed.set_merged();

        self.fragment(self.next_phys(offset)).set_prev_phys(Some(offset));
        self.header().fragments.sub(1);
    }

    /// Accounts for a fragment of `size` bytes becoming busy.
    pub(crate) fn account_allocation(&self, size: usize) {
        let header = self.header();

        header.used.add(size);
        let real_used = header.real_used.add(size + Self::overhead());
        header.max_real_used.raise(real_used);
    }

    /// Accounts for a busy fragment of `size` bytes being released.
    pub(crate) fn account_deallocation(&self, size: usize) {
        let header = self.header();

        header.used.sub(size);
        header.real_used.sub(size + Self::overhead());
    }

    /// Marks the detached fragment at `offset` as busy, and returns its payload.
    pub(crate) fn hand_out(&self, offset: Offset, site: Option<Site>) -> NonNull<u8> {
        let fragment = self.fragment(offset);

        self.account_allocation(fragment.size());
        fragment.set_site(site);
        fragment.set_tag(0);

        self.payload(offset)
    }

    /// Records the blocks allocated from the arena for its own statistics.
    pub(crate) fn publish_statistics(&self, statistics: Option<Offset>, usage: Option<Offset>) {
        let header = self.header();

        header.statistics.store(statistics);
        header.usage.store(usage);
        header.statistics_ready.store(true, Ordering::Release);
    }

    /// Logs the failure to allocate `size` bytes.
    #[cold]
    #[inline(never)]
    pub(crate) fn report_exhaustion(&self, size: usize) {
        let header = self.header();

        //  The usage counters are only reliable once the statistics are ready.
        if !header.statistics_ready() {
            error!("{}: out of memory, cannot allocate {} bytes, statistics not ready yet", self.name(), size);
            return;
        }

        let real_used = header.real_used();

        error!("{}: out of memory, cannot allocate {} bytes: used {}, real used {}, free {}, total {}",
            self.name(), size, header.used(), real_used, header.size.saturating_sub(real_used), header.size);
    }

    //  Internal.
    fn is_sorted(&self, index: usize) -> bool { index < self.classes() && !Properties::<C>::is_linear(index) }

    //  Internal.
    fn fragment_ptr(&self, offset: Offset) -> *mut Fragment {
        //  Safety:
        //  -   `offset` is assumed to be within bounds.
        unsafe { self.base.as_ptr().add(offset.value()) as *mut Fragment }
    }

    //  Internal.
    fn control_size(secondary: usize) -> usize {
        let buckets = Properties::<C>::number_classes() * (1 + secondary);

        Self::round_up(mem::size_of::<Header>() + buckets * mem::size_of::<Bucket>())
    }

    //  Internal.
    fn round_up(size: usize) -> usize { C::QUANTUM.round_down(size + C::QUANTUM.value() - 1) }
}

/// Iterator over a free list.
pub(crate) struct FreeList<'a, C> {
    arena: &'a Arena<C>,
    next: Option<Offset>,
    limit: usize,
}

impl<'a, C> Iterator for FreeList<'a, C>
    where
        C: Configuration,
{
    type Item = Offset;

    fn next(&mut self) -> Option<Offset> {
        let current = self.next.take()?;

        if self.limit == 0 {
            error!("{}: free list cycle detected at offset {}", self.arena.name(), current.value());
            return None;
        }

        self.limit -= 1;
        self.next = self.arena.fragment(current).next_free();

        Some(current)
    }
}

/// Iterator over all the fragments of an arena, in physical order.
///
/// Every offset is checked before being followed, stopping the walk on corrupted sizes.
pub(crate) struct Walk<'a, C> {
    arena: &'a Arena<C>,
    next: Option<Offset>,
    complete: bool,
}

impl<'a, C> Walk<'a, C> {
    /// Returns whether the walk reached the sentinel.
    pub(crate) fn is_complete(&self) -> bool { self.complete }
}

impl<'a, C> Iterator for Walk<'a, C>
    where
        C: Configuration,
{
    type Item = Offset;

    fn next(&mut self) -> Option<Offset> {
        let current = self.next.take()?;
        let sentinel = self.arena.sentinel();

        if current == sentinel {
            self.complete = true;
            return None;
        }

        let size = self.arena.fragment(current).size();

        let next = current.value()
            .checked_add(Arena::<C>::overhead())
            .and_then(|n| n.checked_add(size))
            .filter(|n| *n <= sentinel.value() && *n % C::QUANTUM == 0);

        match next {
            Some(next) => self.next = Offset::new(next),
            None => error!("{}: corrupted fragment of {} bytes at offset {}",
                self.arena.name(), size, current.value()),
        }

        Some(current)
    }
}

/// Misuse of a heap by its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Misuse {
    /// The pointer does not point to the payload of a fragment.
    Foreign(NonNull<u8>),
    /// The fragment is already free, or was merged into its predecessor.
    AlreadyFree {
        pointer: NonNull<u8>,
        site: Option<Site>,
    },
}

impl Misuse {
    /// Logs the misuse, and aborts on double free when tracking.
    #[cold]
    #[inline(never)]
    pub(crate) fn report<P>(&self, name: &str, capabilities: Capabilities, platform: &P)
        where
            P: Platform,
    {
        match *self {
            Misuse::Foreign(pointer) =>
                error!("{}: {:p} is not a fragment of this heap, ignored", name, pointer),
            Misuse::AlreadyFree { pointer, site: Some(site) } =>
                error!("{}: {:p} is already free, last released at {}", name, pointer, site),
            Misuse::AlreadyFree { pointer, site: None } =>
                error!("{}: {:p} is already free", name, pointer),
        }

        if capabilities.debug_tracking {
            if let Misuse::AlreadyFree { .. } = self {
                platform.abort();
            }
        }
    }
}
