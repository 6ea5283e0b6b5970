#![no_std]

#![deny(missing_docs)]

//! Building blocks for a multi-process fragment allocator.
//!
//! hpmalloc-core carves a single contiguous region of memory into fragments, filed by size class. It contains:
//! -   A platform trait, used to obtain the region, read a monotonic clock, and abort on fatal misuse.
//! -   A private heap, owned by a single process, without any locking.
//! -   A shared heap, usable concurrently by every process mapping the region, with one lock per bucket.
//! -   Warming patterns, used to pre-fragment a cold shared heap according to a recorded profile.

extern crate alloc;

#[cfg(test)]
extern crate std;

mod api;
mod internals;
mod utils;

pub use api::*;
