//! Platform
//!
//! The Platform trait is used to request the region backing a heap directly from the Platform. By abstracting the
//! underlying platform, it becomes possible to easily port the code to a different OS, or to test it in isolation.

use core::{
    alloc::Layout,
    ptr::NonNull,
};

/// Abstraction of platform specific services.
pub trait Platform {
    /// Allocates a fresh region of memory as per the specified layout.
    ///
    /// Returns None if the request cannot be satisfied.
    ///
    /// A Platform backing a shared heap must return memory which remains visible to every process later forked from
    /// the current one, at the same address.
    ///
    /// #   Safety
    ///
    /// The caller may assume that if a pointer is returned then:
    /// -   The number of usable bytes is _greater than or equal_ to `layout.size()`.
    /// -   The pointer is _at least_ aligned to `layout.align()`.
    ///
    /// `allocate` assumes that:
    /// -   `layout.size()` is a multiple of `layout.align()`.
    /// -   `layout.align()` is non-zero, and is a power of 2.
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Deallocates the supplied region of memory.
    ///
    /// #   Safety
    ///
    /// The caller should no longer reference the memory after calling this function.
    ///
    /// `deallocate` assumes that:
    /// -   `pointer` was allocated by this instance of `Platform`, with `layout` as argument.
    /// -   `pointer` is the value returned by `Platform`, and not an interior pointer.
    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout);

    /// Returns the number of milliseconds elapsed since an arbitrary, fixed, point in time.
    ///
    /// Used to expire lazily computed statistics; the clock must be shared by all processes using a heap.
    fn now_millis(&self) -> u64;

    /// Terminates the process, following a fatal misuse of a heap.
    fn abort(&self) -> !;
}
