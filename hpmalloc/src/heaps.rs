//! The heaps of a server process.

use log::info;

use hpmalloc_core::{PrivateHeap, SharedHeap};

use crate::{Error, HpConfiguration, HpPlatform, Settings, WarmingReport};
use crate::pattern_file::{load_pattern, save_pattern};

/// The private heap of a server, on Linux.
pub type HpPrivateHeap = PrivateHeap<HpConfiguration, HpPlatform>;

/// The shared heap of a server, on Linux.
pub type HpSharedHeap = SharedHeap<HpConfiguration, HpPlatform>;

/// Heaps
///
/// The private and shared heaps of a server, created before forking its worker processes.
///
/// Each forked process inherits its own copy of the private heap, whereas the shared heap remains shared.
pub struct Heaps {
    private: HpPrivateHeap,
    shared: HpSharedHeap,
    settings: Settings,
    warming: Option<WarmingReport>,
}

impl Heaps {
    /// Creates both heaps, then warms the shared heap if enabled and a pattern was recorded.
    ///
    /// Errors on invalid settings, on failure to map either heap, and on a corrupt or incompatible pattern.
    pub fn new(settings: Settings) -> Result<Self, Error> {
        settings.validate()?;

        let capabilities = settings.capabilities();

        let private = HpPrivateHeap::new(HpPlatform::private(), "pkg", settings.private_size, capabilities)?;
        let mut shared =
            HpSharedHeap::new(HpPlatform::shared(), "shm", settings.shared_size, settings.processes, capabilities)?;

        let warming = Self::warm(&mut shared, &settings)?;

        Ok(Self { private, shared, settings, warming })
    }

    /// Returns the private heap.
    pub fn private(&self) -> &HpPrivateHeap { &self.private }

    /// Returns the private heap, for allocations.
    pub fn private_mut(&mut self) -> &mut HpPrivateHeap { &mut self.private }

    /// Returns the shared heap.
    pub fn shared(&self) -> &HpSharedHeap { &self.shared }

    /// Returns the settings the heaps were created with.
    pub fn settings(&self) -> &Settings { &self.settings }

    /// Returns the result of warming the shared heap, if it was warmed.
    pub fn warming_report(&self) -> Option<WarmingReport> { self.warming }

    /// Records the usage of the shared heap so far in the pattern file, for the next run.
    ///
    /// Returns false, without writing anything, if warming is disabled.
    pub fn update_pattern_file(&self) -> Result<bool, Error> {
        let path = match (&self.settings.warming.pattern_file, self.settings.warming.enabled) {
            (Some(path), true) => path,
            _ => return Ok(false),
        };

        save_pattern(path, &self.shared.capture_pattern())?;

        Ok(true)
    }

    //  Internal.
    fn warm(shared: &mut HpSharedHeap, settings: &Settings) -> Result<Option<WarmingReport>, Error> {
        let warming = &settings.warming;

        let path = match (&warming.pattern_file, warming.enabled) {
            (Some(path), true) => path,
            _ => return Ok(None),
        };

        let pattern = match load_pattern(path)? {
            Some(pattern) => pattern,
            None => return Ok(None),
        };

        let report = shared.warm(&pattern, warming.percentage, warming.optimized_percentage)?;

        info!("{}: warmed from {:?}, {}% of the heap", shared.name(), path, warming.percentage);

        Ok(Some(report))
    }
}
