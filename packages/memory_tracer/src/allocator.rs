//! Global allocator hook that feeds the process-wide tracer.

use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;

use crate::Tracer;
use crate::bootstrap::is_in_bookkeeping;

/// A global allocator that records allocations and frees with the process-wide tracer.
///
/// Wraps any [`GlobalAlloc`] implementation, which keeps serving every block. Until
/// [`initialize()`][crate::initialize] has been called, and whenever the tracer is not tracing,
/// the wrapper only forwards.
///
/// A reallocation is recorded as a free of the old block followed by an allocation of the new
/// one, attributed to the call stack of the reallocation.
///
/// # Examples
///
/// ```rust
/// use memory_tracer::Allocator;
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .finish()
    }
}

impl Allocator<System> {
    /// Creates a tracing allocator on top of the system allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates a tracing allocator on top of the provided allocator.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self { inner: allocator }
    }
}

#[inline]
fn active_tracer() -> Option<&'static Tracer> {
    // Allocations made by the tracer itself are served without a second look.
    if is_in_bookkeeping() {
        return None;
    }

    crate::tracer()
}

// SAFETY: We delegate all allocation operations to the underlying allocator, which already
// implements GlobalAlloc safely. Recording never touches the blocks themselves.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc(layout) };

        if !ptr.is_null() {
            if let Some(tracer) = active_tracer() {
                tracer.record_allocation(ptr.addr(), layout.size());
            }
        }

        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Before the real free, so that a reuse of the address is always queued after it.
        if let Some(tracer) = active_tracer() {
            tracer.record_free(ptr.addr());
        }

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };

        if !ptr.is_null() {
            if let Some(tracer) = active_tracer() {
                tracer.record_allocation(ptr.addr(), layout.size());
            }
        }

        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { realloc_recorded(&self.inner, active_tracer(), ptr, layout, new_size) }
    }
}

/// Reallocates through `inner`, recording the move with `tracer` if there is one.
///
/// # Safety
///
/// The same as [`GlobalAlloc::realloc()`].
#[inline]
unsafe fn realloc_recorded<A: GlobalAlloc>(
    inner: &A,
    tracer: Option<&Tracer>,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
) -> *mut u8 {
    if let Some(tracer) = tracer {
        tracer.record_free(ptr.addr());
    }

    // SAFETY: Forwarding the caller's guarantees.
    let new_ptr = unsafe { inner.realloc(ptr, layout, new_size) };

    if let Some(tracer) = tracer {
        if new_ptr.is_null() {
            // The old block is still live and unchanged.
            tracer.record_allocation(ptr.addr(), layout.size());
        } else {
            tracer.record_allocation(new_ptr.addr(), new_size);
        }
    }

    new_ptr
}
