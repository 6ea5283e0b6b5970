//! Statistics and introspection of an arena.
//!
//! The usage counters of the header are maintained by every operation. Free-list statistics are either read from the
//! per-bucket aggregates, with `StatsMode::Fast`, or computed by walking every free list, with `StatsMode::Lazy`.
//!
//! Walking the physical chain of fragments, for audits and allocation sites, is only exact at quiescent points.

use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use alloc::{collections::BTreeMap, vec::Vec};

use crate::{Audit, ClassStatistics, Configuration, MemoryInfo, Properties, SiteUsage, StatsMode};

use super::arena::Arena;
use super::atomic::Counter;
use super::lock::{Locking, RawLock};

/// Number and payload bytes of free fragments.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct FreeTotals {
    pub(crate) fragments: usize,
    pub(crate) bytes: usize,
}

impl FreeTotals {
    fn merge(self, other: FreeTotals) -> FreeTotals {
        FreeTotals { fragments: self.fragments + other.fragments, bytes: self.bytes + other.bytes }
    }
}

/// Returns the free totals of a single bucket, locking it if necessary.
pub(crate) fn bucket_totals<C>(arena: &Arena<C>, index: usize, locking: Locking) -> FreeTotals
    where
        C: Configuration,
{
    let bucket = arena.bucket(index);

    if arena.capabilities().stats == StatsMode::Fast {
        return FreeTotals { fragments: bucket.free_fragments(), bytes: bucket.free_bytes() };
    }

    if bucket.head().is_none() {
        return FreeTotals::default();
    }

    let _guard = locking.guard(bucket.raw_lock());

    arena.free_list(index)
        .fold(FreeTotals::default(), |totals, offset| {
            totals.merge(FreeTotals { fragments: 1, bytes: arena.fragment(offset).size() })
        })
}

/// Returns the free totals of the whole arena, one bucket at a time.
pub(crate) fn free_totals<C>(arena: &Arena<C>, locking: Locking) -> FreeTotals
    where
        C: Configuration,
{
    (0..arena.bucket_count())
        .map(|index| bucket_totals(arena, index, locking))
        .fold(FreeTotals::default(), FreeTotals::merge)
}

/// Combines the usage counters with the free totals.
pub(crate) fn memory_info<C>(arena: &Arena<C>, free: FreeTotals) -> MemoryInfo
    where
        C: Configuration,
{
    let header = arena.header();

    MemoryInfo {
        total: arena.size(),
        used: header.used(),
        real_used: header.real_used(),
        max_real_used: header.max_real_used(),
        free: free.bytes + free.fragments * Arena::<C>::overhead(),
        fragments: header.fragments(),
        free_fragments: free.fragments,
    }
}

/// Returns the statistics of a class, over all its buckets.
pub(crate) fn class_statistics<C>(arena: &Arena<C>, class: usize, locking: Locking) -> ClassStatistics
    where
        C: Configuration,
{
    let totals = arena.buckets_of_class(class)
        .map(|index| bucket_totals(arena, index, locking))
        .fold(FreeTotals::default(), FreeTotals::merge);

    ClassStatistics {
        class,
        class_size: Properties::<C>::class_size(class),
        optimized: arena.bucket(class).is_optimized(),
        free_fragments: totals.fragments,
        free_bytes: totals.bytes,
    }
}

/// Writes a human readable summary of the arena: its usage, followed by one line per non-empty class.
pub(crate) fn write_status<C>(arena: &Arena<C>, info: &MemoryInfo, out: &mut dyn fmt::Write, locking: Locking)
    -> fmt::Result
    where
        C: Configuration,
{
    writeln!(out, "heap {:?}: total {}, used {}, real used {}, max real used {}, free {}, fragments {} ({} free)",
        arena.name(), info.total, info.used, info.real_used, info.max_real_used, info.free, info.fragments,
        info.free_fragments)?;

    for class in 0..arena.classes() {
        let statistics = class_statistics(arena, class, locking);

        if statistics.free_fragments == 0 && !statistics.optimized {
            continue;
        }

        writeln!(out, "    class {:>5} ({:>8} bytes){}: {} free fragments, {} bytes",
            class, statistics.class_size, if statistics.optimized { ", optimized" } else { "" },
            statistics.free_fragments, statistics.free_bytes)?;
    }

    Ok(())
}

/// Returns the busy fragments, grouped by allocation site, largest first.
pub(crate) fn allocation_sites<C>(arena: &Arena<C>) -> Vec<SiteUsage>
    where
        C: Configuration,
{
    let mut sites = BTreeMap::new();

    for offset in arena.walk() {
        let fragment = arena.fragment(offset);

        if fragment.is_free() {
            continue;
        }

        let location = match fragment.site() {
            Some(location) => location,
            None => continue,
        };

        let usage = sites.entry((location.file(), location.line(), location.column()))
            .or_insert(SiteUsage { location, fragments: 0, bytes: 0 });

        usage.fragments += 1;
        usage.bytes += fragment.size();
    }

    let mut result: Vec<_> = sites.into_values().collect();
    result.sort_by(|a, b| b.bytes.cmp(&a.bytes));

    result
}

/// Walks every fragment, checking the accounting of the arena.
pub(crate) fn audit<C>(arena: &Arena<C>) -> Audit
    where
        C: Configuration,
{
    let mut result = Audit {
        total: arena.size(),
        init_overhead: arena.init_overhead(),
        overhead: Arena::<C>::overhead(),
        ..Audit::default()
    };

    let mut previous_free = false;
    let mut walk = arena.walk();

    for offset in walk.by_ref() {
        let fragment = arena.fragment(offset);
        let free = fragment.is_free();

        if free {
            result.free_fragments += 1;
            result.free_bytes += fragment.size();

            if previous_free {
                result.adjacent_free += 1;
            }
        } else {
            result.busy_fragments += 1;
            result.busy_bytes += fragment.size();
        }

        previous_free = free;
    }

    result.complete = walk.is_complete();
    result
}

/// Lazily computed free totals, shared by all processes using an arena.
#[repr(C)]
#[derive(Default)]
pub(crate) struct LazyCache {
    lock: RawLock,
    valid: AtomicBool,
    stamp: AtomicU64,
    fragments: Counter,
    bytes: Counter,
}

impl LazyCache {
    /// Returns the cached totals, if computed less than `ttl` milliseconds before `now`.
    pub(crate) fn get(&self, now: u64, ttl: u64) -> Option<FreeTotals> {
        let _guard = self.lock.lock();

        if !self.valid.load(Ordering::Relaxed) || now.saturating_sub(self.stamp.load(Ordering::Relaxed)) >= ttl {
            return None;
        }

        Some(FreeTotals { fragments: self.fragments.load(), bytes: self.bytes.load() })
    }

    /// Caches `totals`, computed at `now`.
    pub(crate) fn set(&self, now: u64, totals: FreeTotals) {
        let _guard = self.lock.lock();

        self.fragments.store(totals.fragments);
        self.bytes.store(totals.bytes);
        self.stamp.store(now, Ordering::Relaxed);
        self.valid.store(true, Ordering::Relaxed);
    }
}
