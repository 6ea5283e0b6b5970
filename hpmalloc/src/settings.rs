//! Settings of the heaps of a server.
//!
//! Settings are read from JSON; any missing field takes its default value.
//!
//! ```json
//! {
//!     "private_size": 4194304,
//!     "shared_size": 33554432,
//!     "processes": 8,
//!     "warming": { "enabled": true, "pattern_file": "/var/lib/server/pattern", "percentage": 75 }
//! }
//! ```

use std::{fs, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};

use crate::{Capabilities, Error, HpPrivateHeap, HpSharedHeap, StatsMode};

/// Settings
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Size of the private heap of each process, in bytes.
    pub private_size: usize,
    /// Size of the shared heap, in bytes.
    pub shared_size: usize,
    /// Number of processes sharing the shared heap, hence of sub-buckets of each optimized class.
    pub processes: usize,
    /// Record the allocation site of every fragment, and abort on double free.
    pub debug_tracking: bool,
    /// Maintain free-list statistics on every operation, rather than computing them on demand.
    pub fast_stats: bool,
    /// For how long statistics computed on demand are reused, in milliseconds.
    pub stats_ttl_ms: u64,
    /// Warming of the shared heap.
    pub warming: WarmingSettings,
}

impl Settings {
    /// Parses, then validates, settings.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let settings: Settings = serde_json::from_str(text)?;

        settings.validate()?;

        Ok(settings)
    }

    /// Reads, then validates, settings from the file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|source| Error::Io { path: path.to_owned(), source })?;

        Self::from_json(&text)
    }

    /// Checks that the heaps can be created with these settings.
    pub fn validate(&self) -> Result<(), Error> {
        fn invalid(name: &'static str, reason: String) -> Result<(), Error> {
            Err(Error::InvalidSetting { name, reason })
        }

        let private_minimum = HpPrivateHeap::minimum_size();

        if self.private_size < private_minimum {
            return invalid("private_size",
                format!("{} is below the minimum of {}", self.private_size, private_minimum));
        }

        if self.processes == 0 {
            return invalid("processes", "at least 1 process is necessary".to_string());
        }

        let shared_minimum = HpSharedHeap::minimum_size(self.processes);

        if self.shared_size < shared_minimum {
            return invalid("shared_size", format!("{} is below the minimum of {} for {} processes",
                self.shared_size, shared_minimum, self.processes));
        }

        for &(name, value) in &[
            ("warming.percentage", self.warming.percentage),
            ("warming.optimized_percentage", self.warming.optimized_percentage),
        ] {
            if value > 100 {
                return invalid(name, format!("{} is not within 0 and 100", value));
            }
        }

        if self.warming.enabled && self.warming.pattern_file.is_none() {
            return invalid("warming.pattern_file", "required when warming is enabled".to_string());
        }

        Ok(())
    }

    /// Returns the capabilities of both heaps.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            debug_tracking: self.debug_tracking,
            stats: if self.fast_stats { StatsMode::Fast } else { StatsMode::Lazy },
            stats_ttl_ms: self.stats_ttl_ms,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            private_size: 4 * 1024 * 1024,
            shared_size: 32 * 1024 * 1024,
            processes: num_cpus::get(),
            debug_tracking: false,
            fast_stats: true,
            stats_ttl_ms: 1_000,
            warming: WarmingSettings::default(),
        }
    }
}

/// Settings of the warming of the shared heap.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarmingSettings {
    /// Whether to warm the shared heap on start-up, and record its pattern on demand.
    pub enabled: bool,
    /// Path of the pattern file.
    pub pattern_file: Option<PathBuf>,
    /// Percentage of the shared heap pre-fragmented on start-up.
    pub percentage: u32,
    /// Percentage of the linear classes, in decreasing order of demand, which are optimized.
    pub optimized_percentage: u32,
}

impl Default for WarmingSettings {
    fn default() -> Self { Self { enabled: false, pattern_file: None, percentage: 75, optimized_percentage: 10 } }
}
