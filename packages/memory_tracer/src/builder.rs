//! Configuration of a [`Tracer`][crate::Tracer] before it is created.

use std::alloc::System;
use std::fmt;
use std::path::PathBuf;

use crate::tracer::RealAllocator;
use crate::{
    BacktraceStackBackend, BacktraceSymbolBackend, DEFAULT_SKIP_FRAMES, MAX_FRAMES, StackBackend,
    SymbolBackend, Tracer,
};

/// The directory reports are written to unless configured otherwise.
pub const DEFAULT_REPORT_DIR: &str = "./MemoryTracer_Report";

/// Configures and creates a [`Tracer`].
///
/// Obtained from [`Tracer::builder()`]. Every setting has a default suitable for tracing the
/// current process with full symbol information.
///
/// # Examples
///
/// ```rust
/// use memory_tracer::Tracer;
///
/// let tracer = Tracer::builder()
///     .report_dir("target/memory-reports")
///     .max_frames(16)
///     .build();
///
/// assert_eq!(tracer.report_dir().to_str(), Some("target/memory-reports"));
/// ```
#[must_use]
pub struct TracerBuilder {
    pub(crate) allocator: RealAllocator,
    pub(crate) stacks: Box<dyn StackBackend>,
    pub(crate) symbols: Box<dyn SymbolBackend>,
    pub(crate) report_dir: PathBuf,
    pub(crate) skip_frames: usize,
    pub(crate) max_frames: usize,
}

impl TracerBuilder {
    pub(crate) fn new() -> Self {
        Self {
            allocator: &System,
            stacks: Box::new(BacktraceStackBackend),
            symbols: Box::new(BacktraceSymbolBackend),
            report_dir: PathBuf::from(DEFAULT_REPORT_DIR),
            skip_frames: DEFAULT_SKIP_FRAMES,
            max_frames: MAX_FRAMES,
        }
    }

    /// Sets the allocator that [`Tracer::add_allocation()`] and [`Tracer::remove_allocation()`]
    /// forward to. Defaults to [`System`].
    ///
    /// Has no effect on [`Allocator`][crate::Allocator], which always forwards to the allocator
    /// it wraps.
    pub fn allocator(mut self, allocator: RealAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Sets how call stacks are captured. Defaults to [`BacktraceStackBackend`].
    pub fn stack_backend(mut self, backend: impl StackBackend) -> Self {
        self.stacks = Box::new(backend);
        self
    }

    /// Sets how reported addresses are resolved. Defaults to [`BacktraceSymbolBackend`].
    pub fn symbol_backend(mut self, backend: impl SymbolBackend) -> Self {
        self.symbols = Box::new(backend);
        self
    }

    /// Sets the directory snapshot reports are written to. Defaults to [`DEFAULT_REPORT_DIR`].
    pub fn report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = dir.into();
        self
    }

    /// Sets how many of the innermost frames are dropped from every captured stack, to hide the
    /// tracer's own frames. Defaults to [`DEFAULT_SKIP_FRAMES`].
    pub fn skip_frames(mut self, skip_frames: usize) -> Self {
        self.skip_frames = skip_frames;
        self
    }

    /// Sets how many frames are kept per call stack, at most [`MAX_FRAMES`].
    ///
    /// Larger values are clamped to [`MAX_FRAMES`]. Defaults to [`MAX_FRAMES`].
    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames.min(MAX_FRAMES);
        self
    }

    /// Creates the tracer, initializing the symbol backend.
    ///
    /// If the symbol backend cannot be initialized, the tracer still works but its reports show
    /// raw addresses only.
    #[must_use]
    pub fn build(self) -> Tracer {
        Tracer::from_builder(self)
    }
}

impl fmt::Debug for TracerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerBuilder")
            .field("stacks", &self.stacks)
            .field("symbols", &self.symbols)
            .field("report_dir", &self.report_dir)
            .field("skip_frames", &self.skip_frames)
            .field("max_frames", &self.max_frames)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(TracerBuilder: Send, fmt::Debug);

    #[test]
    fn defaults() {
        let builder = TracerBuilder::new();

        assert_eq!(builder.report_dir, PathBuf::from(DEFAULT_REPORT_DIR));
        assert_eq!(builder.skip_frames, DEFAULT_SKIP_FRAMES);
        assert_eq!(builder.max_frames, MAX_FRAMES);
    }

    #[test]
    fn max_frames_is_clamped() {
        assert_eq!(TracerBuilder::new().max_frames(1000).max_frames, MAX_FRAMES);
        assert_eq!(TracerBuilder::new().max_frames(4).max_frames, 4);
    }

    #[test]
    fn settings_are_applied() {
        let builder = TracerBuilder::new().report_dir("elsewhere").skip_frames(5);

        assert_eq!(builder.report_dir, PathBuf::from("elsewhere"));
        assert_eq!(builder.skip_frames, 5);
    }
}
