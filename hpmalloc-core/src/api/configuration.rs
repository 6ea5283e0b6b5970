//! The configuration of hpmalloc-core.
//!
//! A single Configuration should be used for all heaps of a given process, and all processes sharing a heap.
//!
//! Requested sizes are rounded up to a multiple of the quantum, then filed into size classes:
//!
//! -   Linear classes: one class per multiple of the quantum, up to and including the optimize threshold.
//! -   Exponential classes: one class per power of 2 above the optimize threshold.
//!
//! The layout of the classes is recorded in warming patterns, hence any change to the Configuration invalidates
//! previously recorded patterns.

use core::mem;

use super::PowerOf2;

/// Configuration
///
/// The Configuration allows adjusting the layout of the size classes, and the splitting thresholds.
pub trait Configuration {
    /// The alignment unit, every fragment size is a multiple of it.
    ///
    /// Must be at least the alignment of a pointer.
    const QUANTUM: PowerOf2;

    /// The largest size served by a linear class.
    const OPTIMIZE_THRESHOLD: PowerOf2;

    /// The minimum leftover for which a fragment of the private heap is split, rather than handed out whole.
    const PRIVATE_SPLIT_SIZE: usize;

    /// The minimum leftover for which a fragment of the shared heap is split, rather than handed out whole.
    const SHARED_SPLIT_SIZE: usize;
}

/// Properties
///
/// Properties of a given Configuration.
///
/// Work-around for the inability to implement static methods directly on a trait.
pub struct Properties<C>(C);

impl<C> Properties<C>
    where
        C: Configuration
{
    /// Returns the size actually reserved for a request of `size` bytes, or nothing if it overflows.
    ///
    /// A request for 0 bytes reserves a single quantum.
    pub fn round_up(size: usize) -> Option<usize> {
        if size == 0 {
            return Some(C::QUANTUM.value());
        }

        C::QUANTUM.round_up(size)
    }

    /// Returns the number of linear classes, not counting class 0.
    pub fn linear_classes() -> usize { C::OPTIMIZE_THRESHOLD.value() / C::QUANTUM }

    /// Returns the total number of classes, class 0 included.
    pub fn number_classes() -> usize {
        let bits = mem::size_of::<usize>() * 8;

        Self::linear_classes() + (bits - C::OPTIMIZE_THRESHOLD.log2() as usize) + 1
    }

    /// Returns whether `class` is a linear class.
    pub fn is_linear(class: usize) -> bool { class <= Self::linear_classes() }

    /// Returns the class of a (rounded) size.
    pub fn class_of_size(size: usize) -> usize {
        debug_assert!(size % C::QUANTUM == 0, "{} is not rounded", size);

        if size <= C::OPTIMIZE_THRESHOLD.value() {
            return size / C::QUANTUM;
        }

        let most_significant_bit = (mem::size_of::<usize>() * 8 - 1) - size.leading_zeros() as usize;

        Self::linear_classes() + most_significant_bit - C::OPTIMIZE_THRESHOLD.log2() as usize + 1
    }

    /// Returns the smallest size filed in a given class.
    ///
    /// For linear classes, all sizes filed in the class are equal to this size.
    pub fn class_size(class: usize) -> usize {
        debug_assert!(class < Self::number_classes());

        let linear = Self::linear_classes();

        if class <= linear {
            return class * C::QUANTUM.value();
        }

        let shift = class - linear - 1 + C::OPTIMIZE_THRESHOLD.log2() as usize;

        //  The first exponential class starts right above the threshold.
        if class == linear + 1 { C::OPTIMIZE_THRESHOLD.value() + C::QUANTUM.value() } else { 1 << shift }
    }
}

#[cfg(test)]
mod tests {

use super::*;

struct ServerConfiguration;

impl Configuration for ServerConfiguration {
    const QUANTUM: PowerOf2 = unsafe { PowerOf2::new_unchecked(8) };
    const OPTIMIZE_THRESHOLD: PowerOf2 = unsafe { PowerOf2::new_unchecked(1 << 14) };
    const PRIVATE_SPLIT_SIZE: usize = 256;
    const SHARED_SPLIT_SIZE: usize = 4096;
}

type ServerProperties = Properties<ServerConfiguration>;

#[test]
fn properties_round_up() {
    fn round_up(size: usize) -> Option<usize> { ServerProperties::round_up(size) }

    assert_eq!(Some(8), round_up(0));
    assert_eq!(Some(8), round_up(1));
    assert_eq!(Some(8), round_up(8));
    assert_eq!(Some(56), round_up(50));
    assert_eq!(Some(104), round_up(100));
    assert_eq!(None, round_up(usize::MAX));
}

#[test]
fn properties_classes() {
    assert_eq!(2048, ServerProperties::linear_classes());

    #[cfg(target_pointer_width = "64")]
    assert_eq!(2099, ServerProperties::number_classes());
}

#[test]
fn properties_class_of_size() {
    fn class(size: usize) -> usize { ServerProperties::class_of_size(size) }

    assert_eq!(1, class(8));
    assert_eq!(12, class(96));
    assert_eq!(13, class(104));
    assert_eq!(2048, class(16384));

    assert_eq!(2049, class(16392));
    assert_eq!(2049, class(32760));
    assert_eq!(2050, class(32768));
    assert_eq!(2051, class(65536));

    assert_eq!(ServerProperties::number_classes() - 1, class(usize::MAX - 7));
}

#[test]
fn properties_class_size() {
    fn size(class: usize) -> usize { ServerProperties::class_size(class) }

    assert_eq!(0, size(0));
    assert_eq!(8, size(1));
    assert_eq!(16384, size(2048));
    assert_eq!(16392, size(2049));
    assert_eq!(32768, size(2050));
    assert_eq!(65536, size(2051));
}

#[test]
fn properties_class_size_is_lower_bound() {
    for class in 1..ServerProperties::number_classes() - 1 {
        let lower = ServerProperties::class_size(class);

        assert_eq!(class, ServerProperties::class_of_size(lower), "{}", class);

        let upper = ServerProperties::class_size(class + 1);

        assert_eq!(class, ServerProperties::class_of_size(upper - 8), "{}", class);
    }
}

}
