#![deny(missing_docs)]

//! A fragment allocator for multi-process servers.
//!
//! Each worker process of a server owns a private heap, and all workers share a single shared heap, mapped before
//! they are forked. `Heaps` creates both from `Settings`, and warms the shared heap from the pattern file recorded
//! by a previous run, if any.
//!
//! The allocation algorithms themselves live in hpmalloc-core; this crate provides the Linux platform, the settings,
//! and the persistence of warming patterns.

mod error;
mod heaps;
mod pattern_file;
mod platform;
mod settings;

pub use error::Error;
pub use heaps::{Heaps, HpPrivateHeap, HpSharedHeap};
pub use pattern_file::{load_pattern, save_pattern};
pub use platform::{HpConfiguration, HpPlatform, Sharing};
pub use settings::{Settings, WarmingSettings};

pub use hpmalloc_core::{
    Audit, Capabilities, ClassStatistics, Configuration, MemoryInfo, Properties, SiteUsage, StatsMode,
    WarmingPattern, WarmingReport,
};
