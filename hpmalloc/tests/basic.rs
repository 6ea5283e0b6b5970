use serial_test::serial;

use hpmalloc::{Heaps, Settings, StatsMode};

//
//  Tests
//

#[serial]
#[test]
fn heaps_creation() {
    init_logger();

    let heaps = Heaps::new(settings()).expect("Created");

    assert_eq!("pkg", heaps.private().name());
    assert_eq!("shm", heaps.shared().name());
    assert_eq!(2, heaps.shared().secondary());
    assert_eq!(None, heaps.warming_report());

    let private = heaps.private().info();
    assert_eq!(1 << 20, private.total);
    assert_eq!(0, private.used);
    assert_eq!(1, private.free_fragments);

    //  The statistics of the shared heap are busy from the start.
    let audit = heaps.shared().audit();
    assert!(audit.is_balanced());
    assert_eq!(2, audit.busy_fragments);
    assert_eq!(1, audit.free_fragments);
}

#[serial]
#[test]
fn heaps_invalid_settings() {
    init_logger();

    let result = Heaps::new(Settings { processes: 0, ..settings() });

    assert!(matches!(result, Err(hpmalloc::Error::InvalidSetting { name: "processes", .. })), "{:?}", result.err());
}

#[serial]
#[test]
fn private_first_fit_scenario() {
    init_logger();

    let mut heaps = Heaps::new(settings()).expect("Created");
    let private = heaps.private_mut();

    let a = private.allocate(100).expect("A");
    let b = private.allocate(200).expect("B");

    assert_eq!(Some(104), private.size_of(a));
    assert_eq!(Some(200), private.size_of(b));
    assert_eq!(304, private.info().used);

    unsafe { private.deallocate(a.as_ptr()) };

    //  The hole left by A is the first fit.
    let c = private.allocate(90).expect("C");
    assert_eq!(a, c);
    assert_eq!(Some(104), private.size_of(c));

    unsafe {
        private.deallocate(c.as_ptr());
        private.deallocate(b.as_ptr());
    }

    let info = private.info();
    assert_eq!(0, info.used);
    assert_eq!(1, info.free_fragments);

    let audit = private.audit();
    assert!(audit.is_balanced());
    assert_eq!(0, audit.adjacent_free);
}

#[serial]
#[test]
fn private_reallocate_preserves_contents() {
    init_logger();

    let mut heaps = Heaps::new(settings()).expect("Created");
    let private = heaps.private_mut();

    let pointer = private.allocate(64).expect("Allocated");
    fill(pointer.as_ptr(), 64, 7);

    let _blocker = private.allocate(64).expect("Blocker");

    let moved = unsafe { private.reallocate(pointer.as_ptr(), 10_000) }.expect("Reallocated");
    assert_ne!(pointer, moved);
    assert!(check(moved.as_ptr(), 64, 7));

    let shrunk = unsafe { private.reallocate(moved.as_ptr(), 32) }.expect("Shrunk");
    assert_eq!(moved, shrunk);
    assert!(check(shrunk.as_ptr(), 32, 7));

    assert!(private.audit().is_balanced());
}

#[serial]
#[test]
fn private_exhaustion() {
    init_logger();

    let mut heaps = Heaps::new(settings()).expect("Created");
    let private = heaps.private_mut();

    assert_eq!(None, private.allocate(2 << 20));

    let mut pointers = Vec::new();

    while let Some(pointer) = private.allocate(60_000) {
        pointers.push(pointer);
    }

    assert!(!pointers.is_empty());
    assert!(private.audit().is_balanced());

    for pointer in pointers {
        unsafe { private.deallocate(pointer.as_ptr()) };
    }

    assert!(private.allocate(500_000).is_some());
}

#[serial]
#[test]
fn shared_allocate_deallocate() {
    init_logger();

    let heaps = Heaps::new(settings()).expect("Created");
    let shared = heaps.shared();

    let before = shared.info().used;

    let pointers: Vec<_> = (1..100).map(|i| {
        let pointer = shared.allocate(i * 24).expect("Allocated");
        fill(pointer.as_ptr(), i * 24, i as u8);
        pointer
    }).collect();

    for (i, pointer) in pointers.iter().enumerate() {
        let size = (i + 1) * 24;
        assert!(check(pointer.as_ptr(), size, (i + 1) as u8));
        assert!(shared.size_of(*pointer).expect("Busy") >= size);
    }

    for pointer in pointers {
        unsafe { shared.deallocate(pointer.as_ptr()) };
    }

    assert_eq!(before, shared.info().used);
    assert!(shared.audit().is_balanced());
}

#[serial]
#[test]
fn shared_tags() {
    init_logger();

    let heaps = Heaps::new(settings()).expect("Created");
    let shared = heaps.shared();

    let a = shared.allocate(100).expect("A");
    let b = shared.allocate(100).expect("B");

    assert_eq!(Some(0), shared.tag(a));
    assert!(shared.set_tag(a, 42));
    assert_eq!(Some(42), shared.tag(a));

    //  The statistics blocks are retagged too.
    assert_eq!(4, shared.retag_busy(7));
    assert_eq!(Some(7), shared.tag(a));
    assert_eq!(Some(7), shared.tag(b));
}

#[serial]
#[test]
fn shared_lazy_status() {
    init_logger();

    let heaps = Heaps::new(Settings { fast_stats: false, ..settings() }).expect("Created");
    let shared = heaps.shared();

    assert_eq!(StatsMode::Lazy, shared.capabilities().stats);

    let a = shared.allocate(1_000).expect("A");
    shared.allocate(1_000).expect("B");

    unsafe { shared.deallocate(a.as_ptr()) };

    let mut status = String::new();
    shared.status(&mut status).expect("Written");

    assert!(status.starts_with("heap \"shm\": total 4194304"), "{}", status);
    assert!(status.lines().any(|line| line.contains("class   125")), "{}", status);
}

#[serial]
#[test]
fn debug_tracking_sites() {
    init_logger();

    let mut heaps = Heaps::new(Settings { debug_tracking: true, ..settings() }).expect("Created");

    let private = heaps.private_mut();
    private.allocate(100).expect("Allocated");

    let sites = private.allocation_sites();
    assert_eq!(1, sites.len());
    assert_eq!(file!(), sites[0].location.file());

    let shared = heaps.shared();
    shared.allocate(100).expect("Allocated");

    assert!(shared.allocation_sites().iter().any(|site| site.location.file() == file!()));
}

//
//  Implementation Details
//

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings() -> Settings {
    Settings {
        private_size: 1 << 20,
        shared_size: 4 << 20,
        processes: 2,
        ..Settings::default()
    }
}

fn fill(pointer: *mut u8, size: usize, value: u8) {
    //  Safety:
    //  -   `pointer` points to at least `size` writable bytes.
    unsafe { std::ptr::write_bytes(pointer, value, size) };
}

fn check(pointer: *const u8, size: usize, value: u8) -> bool {
    //  Safety:
    //  -   `pointer` points to at least `size` readable bytes.
    let bytes = unsafe { std::slice::from_raw_parts(pointer, size) };

    bytes.iter().all(|byte| *byte == value)
}
