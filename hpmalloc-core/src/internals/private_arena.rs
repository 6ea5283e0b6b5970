//! Private Arena
//!
//! An arena used by a single thread of a single process at a time, hence without any locking.
//!
//! Released fragments are coalesced with all their free neighbours, so that no two adjacent fragments are ever free.

use core::{cmp, ptr::{self, NonNull}};

use crate::{Capabilities, Configuration, Error, Properties};

use super::arena::{Arena, Misuse, Site};
use super::atomic::Offset;

pub(crate) struct PrivateArena<C> {
    arena: Arena<C>,
}

impl<C> PrivateArena<C>
    where
        C: Configuration,
{
    /// In-place constructs a PrivateArena.
    ///
    /// #   Safety
    ///
    /// -   Same as `Arena::initialize`.
    pub(crate) unsafe fn initialize(place: NonNull<u8>, size: usize, name: &str, capabilities: Capabilities)
        -> Result<Self, Error>
    {
        let arena = Arena::initialize(place, size, name, 0, capabilities)?;

        arena.publish_statistics(None, None);

        Ok(Self { arena })
    }

    pub(crate) fn arena(&self) -> &Arena<C> { &self.arena }

    /// Allocates a fragment of at least `size` bytes.
    pub(crate) fn allocate(&mut self, size: usize, site: Option<Site>) -> Option<NonNull<u8>> {
        let taken = Properties::<C>::round_up(size).and_then(|wanted| self.take(wanted));

        match taken {
            Some(offset) => Some(self.arena.hand_out(offset, site)),
            None => {
                self.arena.report_exhaustion(size);
                None
            },
        }
    }

    /// Releases the fragment whose payload starts at `pointer`.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `pointer` was returned by this arena, and that its payload is no longer in use.
    pub(crate) unsafe fn deallocate(&mut self, pointer: NonNull<u8>, site: Option<Site>) -> Result<(), Misuse> {
        let offset = self.arena.busy_offset_of(pointer)?;
        let fragment = self.arena.fragment(offset);

        self.arena.account_deallocation(fragment.size());
        fragment.set_tag(0);

        let offset = self.merge_previous(offset);
        self.arena.fragment(offset).set_site(site);

        self.release(offset);

        Ok(())
    }

    /// Resizes the fragment whose payload starts at `pointer`, moving it if necessary.
    ///
    /// #   Safety
    ///
    /// -   Same as `deallocate`, if `pointer` is not None.
    pub(crate) unsafe fn reallocate(&mut self, pointer: Option<NonNull<u8>>, size: usize, site: Option<Site>)
        -> Result<Option<NonNull<u8>>, Misuse>
    {
        let pointer = match pointer {
            Some(pointer) => pointer,
            None => return Ok(self.allocate(size, site)),
        };

        if size == 0 {
            self.deallocate(pointer, site)?;
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
            self.shrink(offset, wanted);
            return Ok(Some(pointer));
        }

        if self.grow(offset, wanted) {
            return Ok(Some(pointer));
        }

        let moved = match self.allocate(size, site) {
            Some(moved) => moved,
            None => return Ok(None),
        };

        //  Safety:
        //  -   Both fragments are busy, hence distinct, and at least `old` bytes.
        ptr::copy_nonoverlapping(pointer.as_ptr(), moved.as_ptr(), old);

        self.deallocate(pointer, site)?;

        Ok(Some(moved))
    }

    /// Returns the usable size of the busy fragment whose payload starts at `pointer`.
    pub(crate) fn size_of(&self, pointer: NonNull<u8>) -> Result<usize, Misuse> {
        self.arena.busy_offset_of(pointer).map(|offset| self.arena.fragment(offset).size())
    }

    //  Internal.
    fn minimum_split() -> usize {
        cmp::max(C::PRIVATE_SPLIT_SIZE, Arena::<C>::overhead() + C::QUANTUM.value())
    }

    //  Internal: finds, detaches, and trims a fragment of at least `wanted` bytes.
    fn take(&self, wanted: usize) -> Option<Offset> {
        let class = Properties::<C>::class_of_size(wanted);

        for index in class..self.arena.classes() {
            if let Some(offset) = self.arena.find_fit(index, wanted) {
                self.arena.detach(offset);

                if let Some(rest) = self.arena.split(offset, wanted, Self::minimum_split()) {
                    self.release(rest);
                }

                return Some(offset);
            }
        }

        None
    }

    //  Internal: shrinks the busy fragment at `offset` in place.
    fn shrink(&self, offset: Offset, wanted: usize) {
        let old = self.arena.fragment(offset).size();

        if let Some(rest) = self.arena.split(offset, wanted, Self::minimum_split()) {
            self.arena.account_deallocation(old);
            self.arena.account_allocation(wanted);

            self.release(rest);
        }
    }

    //  Internal: grows the busy fragment at `offset` in place, if its following neighbour is free and large enough.
    fn grow(&self, offset: Offset, wanted: usize) -> bool {
        let fragment = self.arena.fragment(offset);
        let old = fragment.size();

        let next = self.arena.next_phys(offset);
        let neighbour = self.arena.fragment(next);

        if !neighbour.is_free() || old + Arena::<C>::overhead() + neighbour.size() < wanted {
            return false;
        }

        self.arena.detach(next);
        self.arena.absorb(offset, next);
        self.arena.account_deallocation(old);

        if let Some(rest) = self.arena.split(offset, wanted, Self::minimum_split()) {
            self.release(rest);
        }

        self.arena.account_allocation(fragment.size());

        true
    }

    //  Internal: merges the detached fragment at `offset` into its preceding neighbour, if free.
    fn merge_previous(&self, offset: Offset) -> Offset {
        let previous = match self.arena.fragment(offset).prev_phys() {
            Some(previous) if self.arena.fragment(previous).is_free() => previous,
            _ => return offset,
        };

        self.arena.detach(previous);
        self.arena.absorb(previous, offset);

        previous
    }

    //  Internal: merges the following free neighbours into the detached fragment at `offset`, then attaches it.
    fn release(&self, offset: Offset) {
        loop {
            let next = self.arena.next_phys(offset);

            //  The sentinel is never free.
            if !self.arena.fragment(next).is_free() {
                break;
            }

            self.arena.detach(next);
            self.arena.absorb(offset, next);
        }

        let class = Properties::<C>::class_of_size(self.arena.fragment(offset).size());
        self.arena.attach(offset, class);
    }
}

#[cfg(test)]
mod tests {

use core::{panic::Location, slice};

use alloc::vec::Vec;

use crate::{Audit, StatsMode};
use crate::internals::statistics;
use crate::internals::test::{Region, TestConfiguration};

use super::*;

type TestArena = PrivateArena<TestConfiguration>;

const OVERHEAD: usize = 56;

fn create(region: &Region) -> TestArena {
    create_with(region, Capabilities::default())
}

fn create_with(region: &Region, capabilities: Capabilities) -> TestArena {
    unsafe { TestArena::initialize(region.pointer(), region.size(), "private", capabilities) }
        .expect("Large enough")
}

fn audit(arena: &TestArena) -> Audit {
    let audit = statistics::audit(arena.arena());

    assert!(audit.is_balanced(), "{:?}", audit);
    assert_eq!(0, audit.adjacent_free, "{:?}", audit);

    audit
}

fn used(arena: &TestArena) -> usize { arena.arena().header().used() }

fn size_of(arena: &TestArena, pointer: NonNull<u8>) -> usize { arena.size_of(pointer).expect("Busy") }

fn overlaps(first: (NonNull<u8>, usize), second: (NonNull<u8>, usize)) -> bool {
    let (first, second) = ((first.0.as_ptr() as usize, first.1), (second.0.as_ptr() as usize, second.1));

    first.0 < second.0 + second.1 && second.0 < first.0 + first.1
}

#[test]
fn private_overhead() {
    assert_eq!(OVERHEAD, Arena::<TestConfiguration>::overhead());
}

#[test]
fn private_initialize_too_small() {
    let region = Region::new(4096);

    let result = unsafe { TestArena::initialize(region.pointer(), region.size(), "tiny", Capabilities::default()) };

    match result {
        Err(Error::ArenaTooSmall { needed, available }) => {
            assert_eq!(4096, available);
            assert_eq!(Arena::<TestConfiguration>::minimum_size(0), needed);
        },
        _ => panic!("Expected ArenaTooSmall"),
    }
}

#[test]
fn private_initialize_single_fragment() {
    let region = Region::new(1 << 20);
    let arena = create(&region);

    let audit = audit(&arena);

    assert_eq!(1, audit.fragments());
    assert_eq!(1, audit.free_fragments);
    assert_eq!(arena.arena().init_overhead(), arena.arena().header().real_used());
    assert_eq!("private", arena.arena().name());
}

#[test]
fn private_scenario() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let a = arena.allocate(100, None).expect("A");
    assert_eq!(104, size_of(&arena, a));
    assert_eq!(104, used(&arena));

    let b = arena.allocate(50, None).expect("B");
    assert_ne!(a, b);
    assert_eq!(56, size_of(&arena, b));
    assert_eq!(160, used(&arena));

    unsafe { arena.deallocate(a, None) }.expect("Busy");
    assert_eq!(56, used(&arena));

    //  A is reused: the 8 bytes leftover are too few to split off.
    let c = arena.allocate(90, None).expect("C");
    assert_eq!(a, c);
    assert_eq!(104, size_of(&arena, c));
    assert_eq!(160, used(&arena));

    audit(&arena);
}

#[test]
fn private_allocate_within_split_bound() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    for &n in &[1usize, 7, 8, 100, 1000, 1024, 1025, 5000, 70000] {
        let pointer = arena.allocate(n, None).expect("Allocated");
        let size = size_of(&arena, pointer);
        let rounded = Properties::<TestConfiguration>::round_up(n).unwrap();

        assert!(rounded <= size, "{} < {} for {}", size, rounded, n);
        assert!(size < rounded + TestConfiguration::PRIVATE_SPLIT_SIZE, "{} too large for {}", size, n);
    }

    audit(&arena);
}

#[test]
fn private_free_restores_single_fragment() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let before = audit(&arena);

    let pointer = arena.allocate(300, None).expect("Allocated");
    assert_eq!(2, audit(&arena).fragments());

    unsafe { arena.deallocate(pointer, None) }.expect("Busy");

    assert_eq!(before, audit(&arena));
    assert_eq!(0, used(&arena));
    assert_eq!(arena.arena().init_overhead(), arena.arena().header().real_used());
}

#[test]
fn private_coalesce_both_sides() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let pointers: Vec<_> = (0..5).map(|_| arena.allocate(512, None).expect("Allocated")).collect();
    assert_eq!(6, audit(&arena).fragments());

    unsafe {
        arena.deallocate(pointers[1], None).expect("Busy");
        arena.deallocate(pointers[3], None).expect("Busy");
    }

    let audit_before = audit(&arena);
    assert_eq!(3, audit_before.free_fragments);

    //  Merges with both 1 and 3.
    unsafe { arena.deallocate(pointers[2], None) }.expect("Busy");

    let audit_after = audit(&arena);
    assert_eq!(2, audit_after.free_fragments);
    assert_eq!(4, audit_after.fragments());
    assert_eq!(512 * 3 + 2 * OVERHEAD, arena.arena().walk()
        .map(|offset| arena.arena().fragment(offset))
        .filter(|fragment| fragment.is_free())
        .map(|fragment| fragment.size())
        .min()
        .unwrap());
}

#[test]
fn private_double_free() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let a = arena.allocate(64, None).expect("A");
    let _b = arena.allocate(64, None).expect("B");

    let here = Location::caller();

    unsafe { arena.deallocate(a, Some(here)) }.expect("Busy");

    let before = audit(&arena);

    match unsafe { arena.deallocate(a, None) } {
        Err(Misuse::AlreadyFree { pointer, site }) => {
            assert_eq!(a, pointer);
            assert_eq!(Some(here), site);
        },
        _ => panic!("Expected AlreadyFree"),
    }

    assert_eq!(before, audit(&arena));
}

#[test]
fn private_double_free_after_merge() {
    //  Either order of release merges B into A.
    for &(one, other) in &[(0, 1), (1, 0)] {
        let region = Region::new(1 << 20);
        let mut arena = create(&region);

        let blocks: Vec<_> = (0..3).map(|_| arena.allocate(512, None).expect("Allocated")).collect();
        let (b, c) = (blocks[1], blocks[2]);

        unsafe { ptr::write_bytes(c.as_ptr(), 0xc3, 512) };

        unsafe { arena.deallocate(blocks[one], None) }.expect("Busy");
        unsafe { arena.deallocate(blocks[other], None) }.expect("Busy");

        let before = audit(&arena);
        assert_eq!((1, 512), (before.busy_fragments, before.busy_bytes));

        match unsafe { arena.deallocate(b, None) } {
            Err(Misuse::AlreadyFree { pointer, site }) => {
                assert_eq!(b, pointer);
                assert_eq!(None, site);
            },
            _ => panic!("Expected AlreadyFree"),
        }

        assert_eq!(before, audit(&arena));
        assert!(matches!(arena.size_of(b), Err(Misuse::AlreadyFree { .. })));
        assert!(matches!(unsafe { arena.reallocate(Some(b), 16, None) }, Err(Misuse::AlreadyFree { .. })));

        let x = arena.allocate(1000, None).expect("X");
        let y = arena.allocate(512, None).expect("Y");

        let blocks = [(x, size_of(&arena, x)), (y, size_of(&arena, y)), (c, size_of(&arena, c))];

        for (i, first) in blocks.iter().enumerate() {
            for second in &blocks[i + 1..] {
                assert!(!overlaps(*first, *second), "{:?} overlaps {:?}", first, second);
            }
        }

        let c = unsafe { slice::from_raw_parts(c.as_ptr(), 512) };
        assert!(c.iter().all(|byte| *byte == 0xc3));
    }
}

#[test]
fn private_pointer_within_payload() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let a = arena.allocate(512, None).expect("A");
    let _b = arena.allocate(64, None).expect("B");

    //  A lookalike header, attached to bucket 0, with a bogus site; nothing links back to it.
    let fake = [64usize, 0, 0, 0, 0, 0, 0x10];
    assert_eq!(OVERHEAD, core::mem::size_of_val(&fake));

    unsafe {
        ptr::write_bytes(a.as_ptr(), 0, 512);
        ptr::write(a.as_ptr().add(64) as *mut [usize; 7], fake);
    }

    let within = NonNull::new(unsafe { a.as_ptr().add(64 + OVERHEAD) }).unwrap();

    let before = audit(&arena);

    assert!(matches!(unsafe { arena.deallocate(within, None) }, Err(Misuse::Foreign(_))));
    assert!(matches!(arena.size_of(within), Err(Misuse::Foreign(_))));
    assert!(matches!(unsafe { arena.reallocate(Some(within), 16, None) }, Err(Misuse::Foreign(_))));

    //  Zeroed memory does not look like a header either.
    let zeroed = NonNull::new(unsafe { a.as_ptr().add(256 + OVERHEAD) }).unwrap();
    assert!(matches!(unsafe { arena.deallocate(zeroed, None) }, Err(Misuse::Foreign(_))));

    assert_eq!(before, audit(&arena));
    assert_eq!(512, size_of(&arena, a));
}

#[test]
fn private_foreign_pointer() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let a = arena.allocate(64, None).expect("A");

    let misaligned = NonNull::new(unsafe { a.as_ptr().add(3) }).unwrap();
    let outside = NonNull::new(region.pointer().as_ptr()).unwrap();

    assert!(matches!(unsafe { arena.deallocate(misaligned, None) }, Err(Misuse::Foreign(_))));
    assert!(matches!(unsafe { arena.deallocate(outside, None) }, Err(Misuse::Foreign(_))));
    assert!(matches!(arena.size_of(misaligned), Err(Misuse::Foreign(_))));

    audit(&arena);
}

#[test]
fn private_out_of_memory() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    assert_eq!(None, arena.allocate(1 << 20, None));
    assert_eq!(None, arena.allocate(usize::MAX, None));

    let free = arena.arena().size() - arena.arena().header().real_used() - OVERHEAD;
    let all = arena.allocate(free, None).expect("Exactly fits");

    assert_eq!(None, arena.allocate(8, None));

    unsafe { arena.deallocate(all, None) }.expect("Busy");
    assert!(arena.allocate(8, None).is_some());
}

#[test]
fn private_exponential_best_fit() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    //  Sizes all within the same exponential class, separated by busy guards.
    let sizes = [6000usize, 4200, 5000];
    let mut fragments = Vec::new();

    for &size in &sizes {
        fragments.push(arena.allocate(size, None).expect("Allocated"));
        arena.allocate(8, None).expect("Guard");
    }

    for &pointer in &fragments {
        unsafe { arena.deallocate(pointer, None) }.expect("Busy");
    }

    //  The smallest fitting fragment is picked.
    let pointer = arena.allocate(4100, None).expect("Allocated");
    assert_eq!(fragments[1], pointer);

    let pointer = arena.allocate(4500, None).expect("Allocated");
    assert_eq!(fragments[2], pointer);

    audit(&arena);
}

#[test]
fn private_realloc_shrink_in_place() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let a = arena.allocate(4000, None).expect("A");
    let _guard = arena.allocate(8, None).expect("Guard");

    let b = unsafe { arena.reallocate(Some(a), 1000, None) }.expect("Busy").expect("Shrunk");
    assert_eq!(a, b);
    assert_eq!(1000, size_of(&arena, b));
    assert_eq!(1000 + 8, used(&arena));

    //  Too small a difference to split off.
    let c = unsafe { arena.reallocate(Some(b), 900, None) }.expect("Busy").expect("Shrunk");
    assert_eq!(a, c);
    assert_eq!(1000, size_of(&arena, c));

    audit(&arena);
}

#[test]
fn private_realloc_grow_in_place() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let a = arena.allocate(1000, None).expect("A");
    let b = arena.allocate(2000, None).expect("B");
    let _guard = arena.allocate(8, None).expect("Guard");

    unsafe { arena.deallocate(b, None) }.expect("Busy");

    let c = unsafe { arena.reallocate(Some(a), 2500, None) }.expect("Busy").expect("Grown");
    assert_eq!(a, c);
    assert!(size_of(&arena, c) >= 2500);
    assert!(size_of(&arena, c) < 2504 + TestConfiguration::PRIVATE_SPLIT_SIZE);

    audit(&arena);
}

#[test]
fn private_realloc_moves_preserving_content() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let a = arena.allocate(100, None).expect("A");
    let _guard = arena.allocate(8, None).expect("Guard");

    unsafe {
        let bytes = slice::from_raw_parts_mut(a.as_ptr(), 100);
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = i as u8;
        }
    }

    let b = unsafe { arena.reallocate(Some(a), 5000, None) }.expect("Busy").expect("Moved");
    assert_ne!(a, b);

    let bytes = unsafe { slice::from_raw_parts(b.as_ptr(), 100) };
    for (i, byte) in bytes.iter().enumerate() {
        assert_eq!(i as u8, *byte);
    }

    assert_eq!(5000 + 8, used(&arena));
    audit(&arena);
}

#[test]
fn private_realloc_edges() {
    let region = Region::new(1 << 20);
    let mut arena = create(&region);

    let a = unsafe { arena.reallocate(None, 64, None) }.expect("No pointer").expect("Allocated");
    assert_eq!(64, size_of(&arena, a));

    assert_eq!(None, unsafe { arena.reallocate(Some(a), 0, None) }.expect("Busy"));
    assert_eq!(0, used(&arena));

    assert!(matches!(unsafe { arena.reallocate(Some(a), 16, None) }, Err(Misuse::AlreadyFree { .. })));
}

#[test]
fn private_lazy_matches_fast() {
    fn exercise(arena: &mut TestArena) {
        let pointers: Vec<_> = (1..40).map(|i| arena.allocate(i * 24, None).expect("Allocated")).collect();

        for pointer in pointers.iter().step_by(3) {
            unsafe { arena.deallocate(*pointer, None) }.expect("Busy");
        }
    }

    let fast_region = Region::new(1 << 20);
    let mut fast = create(&fast_region);

    let lazy_region = Region::new(1 << 20);
    let mut lazy = create_with(&lazy_region, Capabilities { stats: StatsMode::Lazy, ..Capabilities::default() });

    exercise(&mut fast);
    exercise(&mut lazy);

    let fast_totals = statistics::free_totals(fast.arena(), crate::internals::lock::Locking::Unlocked);
    let lazy_totals = statistics::free_totals(lazy.arena(), crate::internals::lock::Locking::Unlocked);

    assert_eq!(fast_totals, lazy_totals);
    assert_eq!(audit(&fast).free_fragments, fast_totals.fragments);
    assert_eq!(audit(&fast).free_bytes, fast_totals.bytes);
}

}
