//! Implementation of Linux specific calls.

use core::{alloc::Layout, ptr};

use hpmalloc_core::{self, Configuration, PowerOf2};

/// Implementation of the Configuration trait, for servers.
#[derive(Default)]
pub struct HpConfiguration;

impl Configuration for HpConfiguration {
    const QUANTUM: PowerOf2 = unsafe { PowerOf2::new_unchecked(8) };

    //  16 KB
    const OPTIMIZE_THRESHOLD: PowerOf2 = unsafe { PowerOf2::new_unchecked(16 * 1024) };

    const PRIVATE_SPLIT_SIZE: usize = 256;

    const SHARED_SPLIT_SIZE: usize = 4096;
}

/// Visibility of the regions mapped by a platform.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sharing {
    /// Regions are copied-on-write in forked processes.
    Private,
    /// Regions are shared with forked processes.
    Shared,
}

/// Implementation of the Platform trait, for Linux.
///
/// Regions are anonymous memory maps, and are thus page-aligned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HpPlatform {
    sharing: Sharing,
}

impl HpPlatform {
    /// Creates an instance.
    pub const fn new(sharing: Sharing) -> Self { Self { sharing } }

    /// Creates an instance mapping regions private to each process.
    pub const fn private() -> Self { Self::new(Sharing::Private) }

    /// Creates an instance mapping regions shared with forked processes.
    pub const fn shared() -> Self { Self::new(Sharing::Shared) }

    /// Returns the visibility of the regions mapped.
    pub fn sharing(&self) -> Sharing { self.sharing }
}

impl hpmalloc_core::Platform for HpPlatform {
    unsafe fn allocate(&self, layout: Layout) -> Option<ptr::NonNull<u8>> {
        assert!(layout.align() <= PAGE_SIZE,
            "Incorrect alignment: {} > {}", layout.align(), PAGE_SIZE);

        let flags = match self.sharing {
            Sharing::Private => libc::MAP_PRIVATE,
            Sharing::Shared => libc::MAP_SHARED,
        };

        mmap_allocate(layout.size(), flags)
    }

    unsafe fn deallocate(&self, pointer: ptr::NonNull<u8>, layout: Layout) {
        munmap_deallocate(pointer.as_ptr(), layout.size());
    }

    fn now_millis(&self) -> u64 {
        let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };

        //  Safety:
        //  -   `now` is a valid timespec.
        let result = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now as *mut _) };
        assert!(result == 0, "Could not read the monotonic clock: {}", result);

        (now.tv_sec as u64) * 1_000 + (now.tv_nsec as u64) / 1_000_000
    }

    #[cold]
    #[inline(never)]
    fn abort(&self) -> ! {
        //  Safety:
        //  -   Always safe to call.
        unsafe { libc::abort() }
    }
}

//  Minimum size of a page, hence minimum alignment of a memory map.
const PAGE_SIZE: usize = 4096;

//  Wrapper around `mmap`.
//
//  Returns a pointer to `size` bytes of zeroed memory, aligned on a page.
fn mmap_allocate(size: usize, sharing: libc::c_int) -> Option<ptr::NonNull<u8>> {
    let length = size;
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = sharing | libc::MAP_ANONYMOUS;

    //  No specific address hint.
    let addr = ptr::null_mut();
    //  When used in conjunction with MAP_ANONYMOUS, fd is mandated to be -1 on some implementations.
    let fd = -1;
    //  When used in conjunction with MAP_ANONYMOUS, offset is mandated to be 0 on some implementations.
    let offset = 0;

    //  Safety:
    //  -   `addr`, `fd`, and `offset` are suitable for MAP_ANONYMOUS.
    let result = unsafe { libc::mmap(addr, length, prot, flags, fd, offset) };

    let result = if result != libc::MAP_FAILED { result as *mut u8 } else { ptr::null_mut() };
    ptr::NonNull::new(result)
}

//  Wrapper around `munmap`.
//
//  #   Panics
//
//  If `munmap` returns a non-0 result.
//
//  #   Safety
//
//  -   Assumes that `addr` points to a `mmap`ed area of at least `size` bytes.
//  -   Assumes that the range `[addr, addr + size)` is no longer in use.
unsafe fn munmap_deallocate(addr: *mut u8, size: usize) {
    let result = libc::munmap(addr as *mut libc::c_void, size);
    assert!(result == 0, "Could not munmap {:x}, {}: {}", addr as usize, size, result);
}
