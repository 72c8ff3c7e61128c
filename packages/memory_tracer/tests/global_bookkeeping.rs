//! Memory the tracer uses for its own purposes is never attributed to the traced program.
//!
//! The process-wide tracer is shared by every test in a binary, so this binary has exactly one
//! test.

#![cfg(not(miri))] // Miri replaces the global allocator, so cannot be used here.

use std::hint::black_box;

use memory_tracer::Allocator;

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

// Distinctive enough that no other block of the test has this size.
const PATH_LEN: usize = 977;

const BOXES: usize = 2000;

#[test]
fn tracer_bookkeeping_is_not_recorded() {
    let reports = tempfile::tempdir().unwrap();

    let mut report_path = reports.path().to_string_lossy().into_owned();
    report_path.push('/');
    while report_path.len() < PATH_LEN {
        report_path.push('x');
    }

    let mut boxes = Vec::with_capacity(BOXES);

    let tracer = memory_tracer::initialize();
    memory_tracer::start();

    // The path is copied into the tracer while tracing.
    memory_tracer::set_report_path(report_path.as_str());

    // Each box grows the tracer's address index, none of which may show up as a call site.
    for i in 0..BOXES {
        boxes.push(Box::new(i as u64));
    }
    black_box(&boxes);

    memory_tracer::stop();

    tracer
        .inspect_store(|store| {
            let boxes_site = store
                .entries()
                .find(|entry| entry.live_count() == BOXES as u64)
                .expect("the boxes are recorded as one call site");
            assert_eq!(boxes_site.total_bytes(), (BOXES * size_of::<u64>()) as u64);

            for entry in store.entries() {
                let bytes = entry.total_bytes();
                assert!(
                    !(PATH_LEN as u64..=PATH_LEN as u64 + 64).contains(&bytes),
                    "report path copy was recorded: {entry:?}"
                );
                assert!(
                    bytes <= boxes_site.total_bytes(),
                    "tracer storage was recorded: {entry:?}"
                );
            }
        })
        .unwrap();

    assert_eq!(tracer.report_dir().as_os_str().len(), PATH_LEN);

    drop(boxes);
    memory_tracer::finalize();
}
