//! The process-wide tracer used by [`Allocator`][crate::Allocator].

use std::alloc::Layout;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::{Tracer, TracerBuilder};

static TRACER: OnceLock<Tracer> = OnceLock::new();

const ERR_NOT_INITIALIZED: &str =
    "memory tracer is not initialized - call memory_tracer::initialize() first";

/// Creates the process-wide tracer with default settings, if it does not exist yet.
///
/// Returns the process-wide tracer either way. Until this is called, the process-wide
/// functions of this crate panic and [`Allocator`][crate::Allocator] only forwards.
pub fn initialize() -> &'static Tracer {
    TRACER.get_or_init(Tracer::new)
}

/// Creates the process-wide tracer from `builder`, if it does not exist yet.
///
/// If the process-wide tracer already exists, `builder` is discarded and the existing tracer
/// is returned.
pub fn initialize_with(builder: TracerBuilder) -> &'static Tracer {
    TRACER.get_or_init(|| builder.build())
}

/// The process-wide tracer, if [`initialize()`] has been called.
#[inline]
#[must_use]
pub fn tracer() -> Option<&'static Tracer> {
    TRACER.get()
}

fn initialized() -> &'static Tracer {
    TRACER.get().expect(ERR_NOT_INITIALIZED)
}

/// Finalizes the process-wide tracer. See [`Tracer::finalize()`].
///
/// Does nothing if the process-wide tracer was never initialized. The tracer stays finalized
/// for the rest of the process lifetime.
pub fn finalize() {
    if let Some(tracer) = TRACER.get() {
        tracer.finalize();
    }
}

/// Starts the process-wide tracer. See [`Tracer::start()`].
///
/// # Panics
///
/// Panics if [`initialize()`] has not been called.
pub fn start() {
    initialized().start();
}

/// Stops the process-wide tracer. See [`Tracer::stop()`].
///
/// # Panics
///
/// Panics if [`initialize()`] has not been called.
pub fn stop() {
    initialized().stop();
}

/// Requests a snapshot report from the process-wide tracer. See [`Tracer::take_snapshot()`].
///
/// # Panics
///
/// Panics if [`initialize()`] has not been called.
pub fn take_snapshot() {
    initialized().take_snapshot();
}

/// Sets the report directory of the process-wide tracer. See [`Tracer::set_report_path()`].
///
/// # Panics
///
/// Panics if [`initialize()`] has not been called.
pub fn set_report_path(path: impl Into<PathBuf>) {
    initialized().set_report_path(path);
}

/// Allocates through the process-wide tracer. See [`Tracer::add_allocation()`].
///
/// # Safety
///
/// The same as [`GlobalAlloc::alloc()`][std::alloc::GlobalAlloc::alloc]: `layout` must have a
/// non-zero size.
///
/// # Panics
///
/// Panics if [`initialize()`] has not been called.
#[must_use]
pub unsafe fn add_allocation(layout: Layout) -> *mut u8 {
    // SAFETY: Forwarding the caller's guarantees.
    unsafe { initialized().add_allocation(layout) }
}

/// Frees through the process-wide tracer. See [`Tracer::remove_allocation()`].
///
/// # Safety
///
/// `ptr` must have been returned by [`add_allocation()`] with the same `layout`.
///
/// # Panics
///
/// Panics if [`initialize()`] has not been called.
pub unsafe fn remove_allocation(ptr: *mut u8, layout: Layout) {
    // SAFETY: Forwarding the caller's guarantees.
    unsafe { initialized().remove_allocation(ptr, layout) }
}
