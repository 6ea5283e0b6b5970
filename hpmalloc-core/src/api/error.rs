//! Errors reported when creating or warming a heap.
//!
//! Exhaustion and misuse are not errors: allocations report exhaustion by returning nothing, and misuse is logged.

/// Error
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// The region is too small to hold the control structures and a single fragment.
    #[error("a heap of {available} bytes cannot be created, at least {needed} bytes are necessary")]
    ArenaTooSmall {
        /// Minimum number of bytes.
        needed: usize,
        /// Number of bytes requested.
        available: usize,
    },

    /// The platform could not provide the region.
    #[error("the platform could not provide a region of {0} bytes")]
    RegionUnavailable(usize),

    /// The pattern was recorded with a different layout of classes.
    #[error("pattern recorded for quantum {found_quantum} and {found_classes} classes, \
             expected quantum {quantum} and {classes} classes")]
    IncompatiblePattern {
        /// Quantum of the heap.
        quantum: usize,
        /// Number of linear classes of the heap.
        classes: usize,
        /// Quantum recorded in the pattern.
        found_quantum: usize,
        /// Number of linear classes recorded in the pattern.
        found_classes: usize,
    },

    /// The pattern cannot be parsed.
    #[error("corrupt pattern, line {line}: {reason}")]
    CorruptPattern {
        /// Line at which the corruption was detected, 1-based.
        line: usize,
        /// Nature of the corruption.
        reason: &'static str,
    },

    /// A percentage is outside of `0..=100`.
    #[error("percentage {0} is not within 0 and 100")]
    InvalidPercentage(u32),
}
