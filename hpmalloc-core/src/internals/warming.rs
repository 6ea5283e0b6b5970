//! Warming of a shared arena.
//!
//! Capturing converts the per-class usage counters of a shared arena into a pattern; replaying carves the single large
//! free fragment of a cold arena into fragments of each class, in proportion to the pattern.

use alloc::vec::Vec;

use log::{info, warn};

use crate::{Configuration, Error, Properties, WarmingPattern, WarmingReport};

use super::arena::Arena;
use super::lock::Locking;
use super::shared_arena::SharedArena;

/// Captures the usage of the linear classes of `shared` so far.
pub(crate) fn capture<C>(shared: &SharedArena<C>) -> WarmingPattern
    where
        C: Configuration,
{
    let linear = Properties::<C>::linear_classes();
    let overhead = Arena::<C>::overhead();

    let mut counts = shared.usage_counts();
    counts.resize(linear, 0);

    let weights: Vec<f64> = counts.iter()
        .enumerate()
        .map(|(class, count)| (*count as f64) * ((Properties::<C>::class_size(class) + overhead) as f64))
        .collect();

    let total: f64 = weights.iter().sum();

    if total == 0.0 {
        warn!("{}: no allocation recorded, capturing an empty pattern", shared.arena().name());
        return WarmingPattern::new(C::QUANTUM.value(), weights);
    }

    let pattern = WarmingPattern::new(C::QUANTUM.value(), weights.iter().map(|weight| weight / total).collect());

    let sum = pattern.total();

    if sum < 0.99 || sum > 1.01 {
        warn!("{}: captured fractions sum to {:.6}, rather than 1", shared.arena().name(), sum);
    }

    pattern
}

/// Replays `pattern` on the cold arena `shared`, over `percentage` of its size.
///
/// The `optimized_percentage` of linear classes in highest demand are optimized first, if `shared` has sub-buckets.
///
/// The arena must not be in use by any other thread, or process.
pub(crate) fn replay<C>(
    shared: &SharedArena<C>,
    pattern: &WarmingPattern,
    percentage: u32,
    optimized_percentage: u32,
)
    -> Result<WarmingReport, Error>
    where
        C: Configuration,
{
    for &value in &[percentage, optimized_percentage] {
        if value > 100 {
            return Err(Error::InvalidPercentage(value));
        }
    }

    let linear = Properties::<C>::linear_classes();

    if pattern.quantum() != C::QUANTUM.value() || pattern.classes() != linear {
        return Err(Error::IncompatiblePattern {
            quantum: C::QUANTUM.value(),
            classes: linear,
            found_quantum: pattern.quantum(),
            found_classes: pattern.classes(),
        });
    }

    let arena = shared.arena();
    let overhead = Arena::<C>::overhead();
    let budget = (arena.size() as f64) * (percentage as f64) / 100.0;

    //  Class 0 only holds empty fragments, which are never carved.
    let mut demands: Vec<(usize, usize)> = pattern.fractions()
        .iter()
        .enumerate()
        .skip(1)
        .map(|(class, fraction)| {
            let footprint = (Properties::<C>::class_size(class) + overhead) as f64;
            (class, (fraction * budget / footprint) as usize)
        })
        .filter(|(_, count)| *count > 0)
        .collect();

    demands.sort_by(|a, b| b.1.cmp(&a.1));

    let mut report = WarmingReport::default();

    if arena.secondary() > 0 {
        let optimized = linear * (optimized_percentage as usize) / 100;

        report.optimized_classes = demands.iter()
            .take(optimized)
            .filter(|(class, _)| shared.optimize_class(*class))
            .count();
    }

    'demands: for &(class, count) in &demands {
        let size = Properties::<C>::class_size(class);

        for _ in 0..count {
            if !carve(shared, size) {
                report.exhausted = true;
                warn!("{}: warming stopped for lack of memory, at class {}", arena.name(), class);
                break 'demands;
            }

            report.fragments += 1;
        }
    }

    info!("{}: warmed with {} fragments over {} classes, {} classes optimized",
        arena.name(), report.fragments, demands.len(), report.optimized_classes);

    Ok(report)
}

//  Internal: carves a free fragment of `size` bytes from the free fragment preceding the sentinel.
fn carve<C>(shared: &SharedArena<C>, size: usize) -> bool
    where
        C: Configuration,
{
    let arena = shared.arena();

    let big = match arena.fragment(arena.sentinel()).prev_phys() {
        Some(big) if arena.fragment(big).is_free() => big,
        _ => return false,
    };

    if arena.fragment(big).size() < size + Arena::<C>::overhead() + C::QUANTUM.value() {
        return false;
    }

    //  The arena is not used by anyone else, while warming.
    arena.detach(big);

    let rest = arena.split_at(big, size);

    shared.put(big, Locking::Unlocked);
    shared.put(rest, Locking::Unlocked);

    true
}
