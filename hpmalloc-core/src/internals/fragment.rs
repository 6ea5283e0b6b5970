//! Fragment
//!
//! The header preceding the payload of every fragment of an arena.
//!
//! A fragment is free if and only if it is attached to a bucket. Busy fragments, and fragments detached in the midst
//! of being split or merged, are not attached.
//!
//! The header of a fragment absorbed by its predecessor lingers in the payload of the latter, marked as merged, until
//! overwritten.

use core::{
    panic::Location,
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use super::atomic::{AtomicOffset, Offset};

#[repr(C)]
pub(crate) struct Fragment {
    //  Size of the payload, a multiple of the quantum; 0 for the sentinel.
    size: AtomicUsize,
    //  Index of the bucket the fragment is attached to, DETACHED, or MERGED.
    bucket: AtomicUsize,
    //  Free list links, only meaningful while attached.
    prev_free: AtomicOffset,
    next_free: AtomicOffset,
    //  Physically preceding fragment, None for the first.
    prev_phys: AtomicOffset,
    //  Statistics group.
    tag: AtomicUsize,
    //  Site of the last allocation, or deallocation, if tracked.
    site: AtomicPtr<Location<'static>>,
}

impl Fragment {
    const DETACHED: usize = usize::MAX;
    const MERGED: usize = usize::MAX - 1;

    /// Creates a detached fragment.
    pub(crate) fn new(size: usize, prev_phys: Option<Offset>) -> Self {
        let result = Self {
            size: AtomicUsize::new(size),
            bucket: AtomicUsize::new(Self::DETACHED),
            prev_free: AtomicOffset::default(),
            next_free: AtomicOffset::default(),
            prev_phys: AtomicOffset::default(),
            tag: AtomicUsize::new(0),
            site: AtomicPtr::new(ptr::null_mut()),
        };

        result.prev_phys.store(prev_phys);

        result
    }

    pub(crate) fn size(&self) -> usize { self.size.load(Ordering::Relaxed) }

    pub(crate) fn set_size(&self, size: usize) { self.size.store(size, Ordering::Relaxed) }

    pub(crate) fn bucket(&self) -> Option<usize> {
        let bucket = self.bucket.load(Ordering::Relaxed);

        if bucket == Self::DETACHED || bucket == Self::MERGED { None } else { Some(bucket) }
    }

    pub(crate) fn set_bucket(&self, bucket: Option<usize>) {
        self.bucket.store(bucket.unwrap_or(Self::DETACHED), Ordering::Relaxed)
    }

    pub(crate) fn is_free(&self) -> bool { self.bucket().is_some() }

    /// Returns whether the fragment was absorbed by its predecessor.
    pub(crate) fn is_merged(&self) -> bool { self.bucket.load(Ordering::Relaxed) == Self::MERGED }

    /// Marks the detached fragment as absorbed by its predecessor.
    pub(crate) fn set_merged(&self) {
        self.site.store(ptr::null_mut(), Ordering::Relaxed);
        self.bucket.store(Self::MERGED, Ordering::Relaxed);
    }

    /// Returns whether the bucket field holds a value a header may hold, in an arena of `count` buckets.
    pub(crate) fn has_valid_bucket(&self, count: usize) -> bool {
        let bucket = self.bucket.load(Ordering::Relaxed);

        bucket < count || bucket == Self::DETACHED || bucket == Self::MERGED
    }

    pub(crate) fn prev_free(&self) -> Option<Offset> { self.prev_free.load() }

    pub(crate) fn set_prev_free(&self, offset: Option<Offset>) { self.prev_free.store(offset) }

    pub(crate) fn next_free(&self) -> Option<Offset> { self.next_free.load() }

    pub(crate) fn set_next_free(&self, offset: Option<Offset>) { self.next_free.store(offset) }

    pub(crate) fn prev_phys(&self) -> Option<Offset> { self.prev_phys.load() }

    pub(crate) fn set_prev_phys(&self, offset: Option<Offset>) { self.prev_phys.store(offset) }

    pub(crate) fn tag(&self) -> usize { self.tag.load(Ordering::Relaxed) }

    pub(crate) fn set_tag(&self, tag: usize) { self.tag.store(tag, Ordering::Relaxed) }

    /// Returns the recorded site.
    ///
    /// In a shared arena, the site may have been recorded by another process; it is only meaningful if that process
    /// runs the same binary, mapped at the same address, such as a forked sibling.
    pub(crate) fn site(&self) -> Option<&'static Location<'static>> {
        let site = self.site.load(Ordering::Relaxed);

        //  Safety:
        //  -   Only ever set from a `&'static Location`, or null.
        unsafe { site.as_ref() }
    }

    pub(crate) fn set_site(&self, site: Option<&'static Location<'static>>) {
        let site = site.map(|s| s as *const _ as *mut _).unwrap_or(ptr::null_mut());

        self.site.store(site, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn fragment_new_is_detached() {
    let fragment = Fragment::new(64, Offset::new(8));

    assert_eq!(64, fragment.size());
    assert_eq!(None, fragment.bucket());
    assert!(!fragment.is_free());
    assert_eq!(Offset::new(8), fragment.prev_phys());
    assert_eq!(None, fragment.prev_free());
    assert_eq!(None, fragment.next_free());
    assert_eq!(0, fragment.tag());
    assert_eq!(None, fragment.site());
}

#[test]
fn fragment_attach_state() {
    let fragment = Fragment::new(64, None);

    fragment.set_bucket(Some(0));
    assert!(fragment.is_free());
    assert_eq!(Some(0), fragment.bucket());

    fragment.set_bucket(None);
    assert!(!fragment.is_free());
}

#[test]
fn fragment_merged_state() {
    let fragment = Fragment::new(64, None);
    fragment.set_site(Some(Location::caller()));

    fragment.set_merged();

    assert!(fragment.is_merged());
    assert!(!fragment.is_free());
    assert_eq!(None, fragment.bucket());
    assert_eq!(None, fragment.site());

    //  A fresh header at the same place is no longer merged.
    let fragment = Fragment::new(64, None);
    assert!(!fragment.is_merged());
}

#[test]
fn fragment_valid_bucket() {
    let fragment = Fragment::new(64, None);
    assert!(fragment.has_valid_bucket(4));

    fragment.set_merged();
    assert!(fragment.has_valid_bucket(4));

    fragment.set_bucket(Some(3));
    assert!(fragment.has_valid_bucket(4));

    fragment.set_bucket(Some(4));
    assert!(!fragment.has_valid_bucket(4));

    fragment.set_bucket(Some(0x5a5a_5a5a));
    assert!(!fragment.has_valid_bucket(4));
}

#[test]
fn fragment_site() {
    let fragment = Fragment::new(64, None);
    let here = Location::caller();

    fragment.set_site(Some(here));
    assert_eq!(Some(here), fragment.site());

    fragment.set_site(None);
    assert_eq!(None, fragment.site());
}

}
