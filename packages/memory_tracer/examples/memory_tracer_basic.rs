//! Traces a few allocations made through the global allocator and writes two snapshot reports.
//!
//! Run with: `cargo run --example memory_tracer_basic`
//!
//! Reports are written to `./MemoryTracer_Report`, or to the directory given as the first
//! argument. Set `RUST_LOG=debug` to see what the tracer is doing.

use std::hint::black_box;
use std::path::PathBuf;

use memory_tracer::Allocator;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

#[inline(never)]
fn load_table(rows: usize) -> Vec<String> {
    (0..rows).map(|row| format!("row number {row}")).collect()
}

#[inline(never)]
fn load_buffer() -> Vec<u8> {
    vec![1_u8; 256 * 1024]
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    memory_tracer::initialize();

    if let Some(dir) = std::env::args().nth(1) {
        memory_tracer::set_report_path(PathBuf::from(dir));
    }

    memory_tracer::start();

    let table = load_table(1000);
    let buffers = (0..4).map(|_| load_buffer()).collect::<Vec<_>>();

    // Report #0 lists the buffers first, then the table rows.
    memory_tracer::take_snapshot();

    drop(buffers);

    // Report #1 only lists what is still held by the table.
    memory_tracer::take_snapshot();

    black_box(table);

    memory_tracer::stop();

    let tracer = memory_tracer::tracer().expect("initialized above");
    println!(
        "Wrote {} reports to {}",
        tracer.snapshots_taken(),
        tracer.report_dir().display()
    );

    memory_tracer::finalize();
}
