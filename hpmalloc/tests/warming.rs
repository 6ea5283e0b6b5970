use std::{fs, path::Path};

use serial_test::serial;

use hpmalloc::{Error, Heaps, Properties, HpConfiguration, Settings, WarmingSettings};

type HpProperties = Properties<HpConfiguration>;

//
//  Tests
//

#[serial]
#[test]
fn warming_across_runs() {
    init_logger();

    let directory = tempfile::tempdir().expect("Temporary directory");
    let path = directory.path().join("pattern");

    //  First run: nothing recorded yet.
    {
        let heaps = Heaps::new(settings(&path, 75)).expect("Created");
        assert_eq!(None, heaps.warming_report());

        let shared = heaps.shared();

        for _ in 0..300 {
            shared.allocate(64).expect("Allocated");
        }

        for _ in 0..100 {
            shared.allocate(1_000).expect("Allocated");
        }

        assert!(heaps.update_pattern_file().expect("Written"));
    }

    let pattern = hpmalloc::load_pattern(&path).expect("Readable").expect("Present");
    assert_eq!(HpProperties::linear_classes(), pattern.classes());
    assert!(pattern.fractions()[HpProperties::class_of_size(64)] > 0.0);
    assert!(pattern.fractions()[HpProperties::class_of_size(1_000)] > 0.0);

    //  Second run: the shared heap is carved according to the first.
    let heaps = Heaps::new(settings(&path, 75)).expect("Created");

    let report = heaps.warming_report().expect("Warmed");
    assert!(!report.exhausted);
    assert!(report.fragments > 0);
    assert_eq!(2, report.optimized_classes);

    let shared = heaps.shared();

    for &size in &[64, 1_000] {
        let statistics = shared.class_statistics(HpProperties::class_of_size(size)).expect("Linear");

        assert!(statistics.optimized, "{}", size);
        assert!(statistics.free_fragments > 0, "{}", size);
    }

    //  Warmed fragments are handed out as is.
    let free = shared.info().free_fragments;
    let pointer = shared.allocate(64).expect("Allocated");

    assert_eq!(Some(64), shared.size_of(pointer));
    assert_eq!(free - 1, shared.info().free_fragments);

    assert!(shared.audit().is_balanced());
}

#[serial]
#[test]
fn warming_disabled() {
    init_logger();

    let directory = tempfile::tempdir().expect("Temporary directory");
    let path = directory.path().join("pattern");

    let mut settings = settings(&path, 75);
    settings.warming.enabled = false;

    let heaps = Heaps::new(settings).expect("Created");
    heaps.shared().allocate(64).expect("Allocated");

    assert!(!heaps.update_pattern_file().expect("Nothing to write"));
    assert!(!path.exists());
    assert_eq!(None, heaps.warming_report());
}

#[serial]
#[test]
fn warming_corrupt_pattern() {
    init_logger();

    let directory = tempfile::tempdir().expect("Temporary directory");
    let path = directory.path().join("pattern");

    fs::write(&path, "8 2048\n0.5 abc\n").expect("Written");

    let result = Heaps::new(settings(&path, 75));

    assert!(matches!(result, Err(Error::Heap(hpmalloc_core::Error::CorruptPattern { .. }))), "{:?}", result.err());
}

#[serial]
#[test]
fn warming_incompatible_pattern() {
    init_logger();

    let directory = tempfile::tempdir().expect("Temporary directory");
    let path = directory.path().join("pattern");

    fs::write(&path, "16 4\n0.25 0.25 0.25 0.25\n").expect("Written");

    let result = Heaps::new(settings(&path, 75));

    assert!(matches!(result, Err(Error::Heap(hpmalloc_core::Error::IncompatiblePattern { .. }))),
        "{:?}", result.err());
}

//
//  Implementation Details
//

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings(path: &Path, percentage: u32) -> Settings {
    Settings {
        private_size: 1 << 20,
        shared_size: 8 << 20,
        processes: 2,
        warming: WarmingSettings {
            enabled: true,
            pattern_file: Some(path.to_owned()),
            percentage,
            optimized_percentage: 10,
        },
        ..Settings::default()
    }
}
