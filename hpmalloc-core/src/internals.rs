//! The internals of hpmalloc-core.

pub(crate) mod arena;
pub(crate) mod atomic;
pub(crate) mod bucket;
pub(crate) mod fragment;
pub(crate) mod lock;
pub(crate) mod private_arena;
pub(crate) mod shared_arena;
pub(crate) mod statistics;
pub(crate) mod warming;

#[cfg(test)]
pub(crate) mod test;
