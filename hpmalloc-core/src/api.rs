//! The API of hpmalloc-core.

mod configuration;
mod description;
mod error;
mod pattern;
mod platform;
mod private;
mod shared;

pub use configuration::{Configuration, Properties};
pub use description::{Audit, Capabilities, ClassStatistics, MemoryInfo, SiteUsage, StatsMode, WarmingReport};
pub use error::Error;
pub use pattern::WarmingPattern;
pub use platform::Platform;
pub use private::PrivateHeap;
pub use shared::SharedHeap;

pub use crate::utils::PowerOf2;
