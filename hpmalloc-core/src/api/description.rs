//! Descriptions of heaps and their contents, as reported to the user.

use core::panic::Location;

/// How free-list statistics are maintained.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StatsMode {
    /// Per-bucket aggregates are updated on every attach and detach; reading statistics is cheap.
    Fast,
    /// No aggregates are maintained; reading statistics walks every free list, and is cached for a while.
    Lazy,
}

/// Capabilities
///
/// The optional behaviors of a heap, fixed at construction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Capabilities {
    /// Record the allocation site of every fragment, and abort on double free.
    pub debug_tracking: bool,
    /// How free-list statistics are maintained.
    pub stats: StatsMode,
    /// For how long lazily computed statistics are reused, in milliseconds.
    pub stats_ttl_ms: u64,
}

impl Default for Capabilities {
    fn default() -> Self { Self { debug_tracking: false, stats: StatsMode::Fast, stats_ttl_ms: 1000 } }
}

/// Usage of a heap.
///
/// `used` only accounts for the payload of busy fragments, whereas `real_used` also accounts for their headers and the
/// control structures of the heap.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct MemoryInfo {
    /// Size of the heap, in bytes.
    pub total: usize,
    /// Payload bytes of busy fragments.
    pub used: usize,
    /// Bytes consumed by busy fragments, headers included, and by the control structures.
    pub real_used: usize,
    /// High-water mark of `real_used`.
    pub max_real_used: usize,
    /// Bytes available in free fragments, headers included.
    pub free: usize,
    /// Number of fragments, busy or free.
    pub fragments: usize,
    /// Number of free fragments.
    pub free_fragments: usize,
}

/// Free-list statistics of a single class.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ClassStatistics {
    /// Index of the class.
    pub class: usize,
    /// Smallest size filed in the class.
    pub class_size: usize,
    /// Whether the class is spread over sub-buckets.
    pub optimized: bool,
    /// Number of free fragments in the class.
    pub free_fragments: usize,
    /// Payload bytes of the free fragments in the class.
    pub free_bytes: usize,
}

/// Busy fragments allocated from a single site, only recorded with `debug_tracking`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SiteUsage {
    /// Location of the allocation call.
    pub location: &'static Location<'static>,
    /// Number of busy fragments.
    pub fragments: usize,
    /// Payload bytes of those fragments.
    pub bytes: usize,
}

/// Result of walking every fragment of a heap, from first to last.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Audit {
    /// Size of the heap, in bytes.
    pub total: usize,
    /// Bytes consumed by control structures, including the trailing sentinel.
    pub init_overhead: usize,
    /// Bytes consumed by the header of each fragment.
    pub overhead: usize,
    /// Number of busy fragments.
    pub busy_fragments: usize,
    /// Payload bytes of busy fragments.
    pub busy_bytes: usize,
    /// Number of free fragments.
    pub free_fragments: usize,
    /// Payload bytes of free fragments.
    pub free_bytes: usize,
    /// Number of free fragments immediately followed by another free fragment.
    pub adjacent_free: usize,
    /// Whether the walk reached the sentinel, rather than stopping on a corrupted header.
    pub complete: bool,
}

impl Audit {
    /// Returns the number of fragments walked.
    pub fn fragments(&self) -> usize { self.busy_fragments + self.free_fragments }

    /// Returns whether every byte of the heap is accounted for.
    pub fn is_balanced(&self) -> bool {
        let accounted = self.busy_bytes + self.free_bytes + self.overhead * self.fragments() + self.init_overhead;

        self.complete && accounted == self.total
    }
}

/// Result of replaying a warming pattern.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct WarmingReport {
    /// Number of classes marked as optimized.
    pub optimized_classes: usize,
    /// Number of fragments carved out.
    pub fragments: usize,
    /// Whether the replay stopped early, for lack of memory.
    pub exhausted: bool,
}
