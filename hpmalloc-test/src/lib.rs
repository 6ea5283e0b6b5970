//! Test utilities for hpmalloc.
//!
//! The heaps of hpmalloc are shared between threads, and processes; most interesting bugs only show up when
//! operations on a heap overlap. `Lockstep` runs rounds of operations on several threads, starting each round on all
//! threads as simultaneously as possible.

mod lockstep;

pub use lockstep::Lockstep;
