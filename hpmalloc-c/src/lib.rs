#![deny(missing_docs)]

//! Exposition of the Heaps API via a C ABI.
//!
//! The heaps of the process are held in a single global, created by `hp_init` before forking the workers, and destroyed
//! by `hp_destroy` after they all exited.
//!
//! Functions prefixed by `hp_pkg_` operate on the private heap of the calling process, whereas functions prefixed by
//! `hp_shm_` operate on the heap shared by all processes.

use std::{ffi::{CStr, OsStr}, os::raw::c_char, os::unix::ffi::OsStrExt, path::Path, ptr::{self, NonNull}};

use log::{error, info};
use parking_lot::{const_rwlock, RwLock};

use hpmalloc::{Heaps, MemoryInfo, Settings};

/// Usage of a heap.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HpMemoryInfo {
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

impl From<MemoryInfo> for HpMemoryInfo {
    fn from(info: MemoryInfo) -> Self {
        Self {
            total: info.total,
            used: info.used,
            real_used: info.real_used,
            max_real_used: info.max_real_used,
            free: info.free,
            fragments: info.fragments,
            free_fragments: info.free_fragments,
        }
    }
}

/// Creates the heaps, with the settings read from the JSON file at `settings`, or the default settings if NULL.
///
/// Returns 0 on success, and a negative value otherwise:
///
/// -   -1 if the settings cannot be read, or are invalid.
/// -   -2 if the heaps cannot be created, or warmed.
/// -   -3 if the heaps already exist.
///
/// #   Safety
///
/// -   Assumes that `settings`, if not NULL, points to a NUL-terminated string.
#[cold]
#[no_mangle]
pub unsafe extern fn hp_init(settings: *const c_char) -> i32 {
    let settings = if settings.is_null() {
        Settings::default()
    } else {
        let path = Path::new(OsStr::from_bytes(CStr::from_ptr(settings).to_bytes()));

        match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("hp_init: invalid settings {:?}: {}", path, e);
                return -1;
            },
        }
    };

    let mut heaps = HEAPS.write();

    if heaps.is_some() {
        error!("hp_init: heaps already initialized");
        return -3;
    }

    match Heaps::new(settings) {
        Ok(created) => {
            info!("hp_init: heaps initialized, warming {:?}", created.warming_report());
            *heaps = Some(created);
            0
        },
        Err(e) => {
            error!("hp_init: cannot create heaps: {}", e);
            -2
        },
    }
}

/// Destroys the heaps, releasing their memory.
///
/// #   Safety
///
/// -   Assumes that no pointer allocated from either heap is used afterwards.
/// -   Assumes that no other process still uses the shared heap.
#[cold]
#[no_mangle]
pub unsafe extern fn hp_destroy() { *HEAPS.write() = None; }

/// Allocates at least `size` bytes from the private heap, aligned on 8 bytes.
///
/// Returns NULL if the heaps are not initialized, or the private heap is exhausted.
#[no_mangle]
pub extern fn hp_pkg_malloc(size: usize) -> *mut u8 {
    with_heaps_mut(|heaps| into_raw(heaps.private_mut().allocate(size))).unwrap_or(ptr::null_mut())
}

/// Deallocates the memory located at `pointer`, allocated from the private heap.
///
/// NULL is ignored; foreign or already free pointers are logged.
///
/// #   Safety
///
/// -   Assumes the memory pointed by `pointer` is no longer in use.
#[no_mangle]
pub unsafe extern fn hp_pkg_free(pointer: *mut u8) {
    with_heaps_mut(|heaps| heaps.private_mut().deallocate(pointer));
}

/// Resizes the memory located at `pointer`, allocated from the private heap, to at least `size` bytes.
///
/// Behaves as `hp_pkg_malloc` if `pointer` is NULL, and as `hp_pkg_free` if `size` is 0. Returns NULL on exhaustion,
/// leaving the memory at `pointer` untouched.
///
/// #   Safety
///
/// -   Assumes the memory pointed by `pointer` is not otherwise in use.
#[no_mangle]
pub unsafe extern fn hp_pkg_realloc(pointer: *mut u8, size: usize) -> *mut u8 {
    with_heaps_mut(|heaps| into_raw(heaps.private_mut().reallocate(pointer, size))).unwrap_or(ptr::null_mut())
}

/// Returns the usable size of the memory located at `pointer`, allocated from the private heap, or 0 if invalid.
#[no_mangle]
pub extern fn hp_pkg_size(pointer: *mut u8) -> usize {
    let pointer = match NonNull::new(pointer) {
        Some(pointer) => pointer,
        None => return 0,
    };

    with_heaps(|heaps| heaps.private().size_of(pointer)).flatten().unwrap_or(0)
}

/// Fills `info` with the usage of the private heap.
///
/// Returns 0 on success, and -1 if the heaps are not initialized.
///
/// #   Safety
///
/// -   Assumes that `info` points to a writable `HpMemoryInfo`.
#[no_mangle]
pub unsafe extern fn hp_pkg_info(info: *mut HpMemoryInfo) -> i32 {
    write_info(info, with_heaps(|heaps| heaps.private().info()))
}

/// Logs the state of the private heap.
#[cold]
#[no_mangle]
pub extern fn hp_pkg_status() {
    with_heaps(|heaps| {
        let mut status = String::new();

        if heaps.private().status(&mut status).is_ok() {
            info!("{}", status);
        }
    });
}

/// Allocates at least `size` bytes from the shared heap, aligned on 8 bytes.
///
/// Returns NULL if the heaps are not initialized, or the shared heap is exhausted.
#[no_mangle]
pub extern fn hp_shm_malloc(size: usize) -> *mut u8 {
    with_heaps(|heaps| into_raw(heaps.shared().allocate(size))).unwrap_or(ptr::null_mut())
}

/// Allocates at least `size` bytes from the shared heap, without locking it.
///
/// #   Safety
///
/// -   Assumes that no other thread, or process, uses the shared heap concurrently.
#[no_mangle]
pub unsafe extern fn hp_shm_malloc_unsafe(size: usize) -> *mut u8 {
    with_heaps(|heaps| into_raw(heaps.shared().allocate_unlocked(size))).unwrap_or(ptr::null_mut())
}

/// Deallocates the memory located at `pointer`, allocated from the shared heap.
///
/// #   Safety
///
/// -   Assumes the memory pointed by `pointer` is no longer in use, in any process.
#[no_mangle]
pub unsafe extern fn hp_shm_free(pointer: *mut u8) {
    with_heaps(|heaps| heaps.shared().deallocate(pointer));
}

/// Deallocates the memory located at `pointer`, allocated from the shared heap, without locking it.
///
/// #   Safety
///
/// -   As `hp_shm_free`.
/// -   Assumes that no other thread, or process, uses the shared heap concurrently.
#[no_mangle]
pub unsafe extern fn hp_shm_free_unsafe(pointer: *mut u8) {
    with_heaps(|heaps| heaps.shared().deallocate_unlocked(pointer));
}

/// Resizes the memory located at `pointer`, allocated from the shared heap, to at least `size` bytes.
///
/// Behaves as `hp_shm_malloc` if `pointer` is NULL, and as `hp_shm_free` if `size` is 0.
///
/// #   Safety
///
/// -   Assumes the memory pointed by `pointer` is not otherwise in use, in any process.
#[no_mangle]
pub unsafe extern fn hp_shm_realloc(pointer: *mut u8, size: usize) -> *mut u8 {
    with_heaps(|heaps| into_raw(heaps.shared().reallocate(pointer, size))).unwrap_or(ptr::null_mut())
}

/// Resizes the memory located at `pointer`, allocated from the shared heap, without locking it.
///
/// #   Safety
///
/// -   As `hp_shm_realloc`.
/// -   Assumes that no other thread, or process, uses the shared heap concurrently.
#[no_mangle]
pub unsafe extern fn hp_shm_realloc_unsafe(pointer: *mut u8, size: usize) -> *mut u8 {
    with_heaps(|heaps| into_raw(heaps.shared().reallocate_unlocked(pointer, size))).unwrap_or(ptr::null_mut())
}

/// Returns the usable size of the memory located at `pointer`, allocated from the shared heap, or 0 if invalid.
#[no_mangle]
pub extern fn hp_shm_size(pointer: *mut u8) -> usize {
    let pointer = match NonNull::new(pointer) {
        Some(pointer) => pointer,
        None => return 0,
    };

    with_heaps(|heaps| heaps.shared().size_of(pointer)).flatten().unwrap_or(0)
}

/// Sets the statistics group of the memory located at `pointer`, allocated from the shared heap.
///
/// Returns 0 on success, and -1 if `pointer` is invalid.
#[no_mangle]
pub extern fn hp_shm_set_tag(pointer: *mut u8, tag: usize) -> i32 {
    let pointer = match NonNull::new(pointer) {
        Some(pointer) => pointer,
        None => return -1,
    };

    match with_heaps(|heaps| heaps.shared().set_tag(pointer, tag)) {
        Some(true) => 0,
        _ => -1,
    }
}

/// Sets the statistics group of every busy fragment of the shared heap, returning their number.
#[cold]
#[no_mangle]
pub extern fn hp_shm_retag(tag: usize) -> usize {
    with_heaps(|heaps| heaps.shared().retag_busy(tag)).unwrap_or(0)
}

/// Fills `info` with the usage of the shared heap.
///
/// Returns 0 on success, and -1 if the heaps are not initialized.
///
/// #   Safety
///
/// -   Assumes that `info` points to a writable `HpMemoryInfo`.
#[no_mangle]
pub unsafe extern fn hp_shm_info(info: *mut HpMemoryInfo) -> i32 {
    write_info(info, with_heaps(|heaps| heaps.shared().info()))
}

/// Logs the state of the shared heap.
#[cold]
#[no_mangle]
pub extern fn hp_shm_status() {
    with_heaps(|heaps| {
        let mut status = String::new();

        if heaps.shared().status(&mut status).is_ok() {
            info!("{}", status);
        }
    });
}

/// Records the usage of the shared heap in the pattern file, for warming the next run.
///
/// Returns 1 if the pattern was written, 0 if warming is disabled, and -1 on failure.
#[cold]
#[no_mangle]
pub extern fn hp_update_pattern_file() -> i32 {
    match with_heaps(|heaps| heaps.update_pattern_file()) {
        Some(Ok(true)) => 1,
        Some(Ok(false)) => 0,
        Some(Err(e)) => {
            error!("hp_update_pattern_file: {}", e);
            -1
        },
        None => -1,
    }
}

//
//  Implementation
//

static HEAPS: RwLock<Option<Heaps>> = const_rwlock(None);

fn with_heaps<R, F>(fun: F) -> Option<R>
    where
        F: FnOnce(&Heaps) -> R,
{
    HEAPS.read().as_ref().map(fun)
}

//  The private heap is only ever used by the single thread of its process, hence the write lock is never contended.
fn with_heaps_mut<R, F>(fun: F) -> Option<R>
    where
        F: FnOnce(&mut Heaps) -> R,
{
    HEAPS.write().as_mut().map(fun)
}

fn into_raw(pointer: Option<NonNull<u8>>) -> *mut u8 {
    pointer.map(NonNull::as_ptr).unwrap_or(ptr::null_mut())
}

unsafe fn write_info(destination: *mut HpMemoryInfo, info: Option<MemoryInfo>) -> i32 {
    match (NonNull::new(destination), info) {
        (Some(destination), Some(info)) => {
            ptr::write(destination.as_ptr(), info.into());
            0
        },
        _ => -1,
    }
}
