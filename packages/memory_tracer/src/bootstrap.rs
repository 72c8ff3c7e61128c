//! Allocation path reserved for the tracer's own bookkeeping.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

thread_local! {
    // Set while the current thread runs tracer bookkeeping: stack capture, queueing, aggregation
    // and report synthesis. Allocations made while the flag is set are forwarded to the real
    // allocator without being recorded, so the tracer never observes (or recurses into) itself.
    //
    // This must stay a const-initialized `Cell` without drop glue. The global allocator may be
    // entered during thread teardown, after TLS destructors have run, and a value with a
    // destructor would make this access fail at exactly that point.
    static IN_BOOKKEEPING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running tracer bookkeeping until dropped.
///
/// Scopes do not nest: entering while already inside one yields `None`, which is how the
/// allocation entry points detect that they were reached reentrantly from tracer code.
#[derive(Debug)]
pub(crate) struct BookkeepingScope {
    // The flag is per-thread, so the scope must be released on the thread that entered it.
    _not_send: PhantomData<*const ()>,
}

impl BookkeepingScope {
    /// Enters bookkeeping on the current thread, or returns `None` if the thread is already
    /// inside a bookkeeping scope.
    #[must_use]
    pub(crate) fn enter() -> Option<Self> {
        if IN_BOOKKEEPING.replace(true) {
            return None;
        }

        Some(Self {
            _not_send: PhantomData,
        })
    }
}

impl Drop for BookkeepingScope {
    fn drop(&mut self) {
        IN_BOOKKEEPING.set(false);
    }
}

/// Whether the current thread is inside a bookkeeping scope.
#[must_use]
pub(crate) fn is_in_bookkeeping() -> bool {
    IN_BOOKKEEPING.get()
}

/// The allocator the tracer uses for its own storage.
///
/// It goes straight to the operating system allocator and is never routed through the
/// instrumented entry points, no matter which allocator the application installed as its
/// global allocator. The operation channel stores every queued command in memory obtained
/// from here.
///
/// The allocator is stateless and safe to use from any number of threads at once.
///
/// # Examples
///
/// ```rust
/// use std::alloc::{GlobalAlloc, Layout};
///
/// use memory_tracer::BootstrapAllocator;
///
/// let layout = Layout::new::<u64>();
///
/// // SAFETY: The layout has a non-zero size.
/// let ptr = unsafe { BootstrapAllocator.alloc(layout) };
/// assert!(!ptr.is_null());
///
/// // SAFETY: The pointer came from the same allocator with the same layout.
/// unsafe { BootstrapAllocator.dealloc(ptr, layout) };
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct BootstrapAllocator;

impl BootstrapAllocator {
    /// Moves `value` into memory owned by the bootstrap allocator.
    ///
    /// Returns `None` (dropping `value`) if the system allocator is exhausted.
    #[must_use]
    pub(crate) fn allocate<T>(value: T) -> Option<NonNull<T>> {
        let layout = Layout::new::<T>();

        if layout.size() == 0 {
            let ptr = NonNull::<T>::dangling();
            // SAFETY: Writes of zero-sized values through a dangling, aligned pointer are valid.
            unsafe { ptr.as_ptr().write(value) };
            return Some(ptr);
        }

        // SAFETY: The layout has a non-zero size, as checked above.
        let raw = unsafe { Self.alloc(layout) }.cast::<T>();
        let ptr = NonNull::new(raw)?;

        // SAFETY: The memory was just allocated with the layout of `T`, so it is valid for
        // writes and properly aligned.
        unsafe { ptr.as_ptr().write(value) };

        Some(ptr)
    }

    /// Moves the value back out of bootstrap memory and frees that memory.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate()`][Self::allocate] for the same `T` and must
    /// not have been released before.
    pub(crate) unsafe fn release<T>(ptr: NonNull<T>) -> T {
        // SAFETY: Forwarding the caller's guarantee that `ptr` holds a live `T` we own.
        let value = unsafe { ptr.as_ptr().read() };

        let layout = Layout::new::<T>();

        if layout.size() != 0 {
            // SAFETY: Forwarding the caller's guarantee that `ptr` came from `allocate()`, which
            // used this exact layout.
            unsafe { Self.dealloc(ptr.as_ptr().cast(), layout) };
        }

        value
    }
}

// SAFETY: Every operation is forwarded unchanged to the system allocator, which upholds the
// `GlobalAlloc` contract.
unsafe impl GlobalAlloc for BootstrapAllocator {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.alloc(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.alloc_zeroed(layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}
