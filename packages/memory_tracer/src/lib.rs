//! In-process allocation tracer that attributes live memory to call sites.
//!
//! Every allocation made while tracing is recorded together with the call stack that made it.
//! Live memory is aggregated per distinct call stack, and on request the tracer writes a
//! snapshot report listing each call site with its live bytes and block count, largest first,
//! with symbolized frames.
//!
//! The core functionality includes:
//! - [`Allocator`] - A global allocator wrapper that feeds the process-wide tracer
//! - [`Tracer`] - The tracer itself, usable directly with custom backends
//! - [`AggregationStore`] - Live memory keyed by address and by call site
//! - [`SnapshotReport`] - The ranked, symbolized view that is written to report files
//!
//! This package is meant for finding memory hogs and leaks during development, not for use in
//! production.
//!
//! # Simple usage
//!
//! ```
//! use memory_tracer::Allocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     let reports = tempfile::tempdir().unwrap();
//!
//!     memory_tracer::initialize();
//!     memory_tracer::set_report_path(reports.path());
//!     memory_tracer::start();
//!
//!     let data = vec![0_u8; 1024 * 1024];
//!     memory_tracer::take_snapshot();
//!     drop(data);
//!
//!     // Waits until the snapshot has been written.
//!     memory_tracer::stop();
//!     memory_tracer::finalize();
//!
//!     assert!(reports.path().join("MemoryTracer_Report #0.txt").exists());
//! }
//! ```
//!
//! # Report format
//!
//! Reports are plain text files named `MemoryTracer_Report #<n>.txt`, where `n` counts the
//! snapshots taken by the tracer. Each call site is one block:
//!
//! ```text
//! ------- 1.00 MB / 1 times -------
//! 0x000055d0c2a1b2c3 - my_app::load_assets : src/assets.rs (42)
//! 0x000055d0c2a1a000 - my_app::main : src/main.rs (7)
//! ```
//!
//! A report taken while nothing is live consists of [`EMPTY_REPORT`] only.
//!
//! # How it works
//!
//! Allocating threads do as little as possible: they capture the call stack into a fixed-size
//! buffer and push a command onto a lock-free queue whose nodes come from
//! [`BootstrapAllocator`], a path that bypasses the tracer. A single consumer thread applies the
//! commands in queue order, so a snapshot reflects exactly what was queued before it. Whatever
//! the tracer allocates for its own purposes is never recorded.
//!
//! # Logging
//!
//! Lifecycle transitions, written reports and failures are logged through [`tracing`]. Nothing is
//! logged per allocation.
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic and cannot walk native call stacks, so
//! only the parts of this package that do not capture stacks can be exercised under Miri.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod allocator;
mod bootstrap;
mod builder;
mod channel;
mod command;
mod error;
mod global;
mod report;
mod stack;
mod store;
mod symbols;
mod tracer;

#[cfg(test)]
mod test_support;

pub use allocator::*;
pub use bootstrap::BootstrapAllocator;
pub use builder::*;
pub use error::*;
pub use global::*;
pub use report::*;
pub use stack::*;
pub use store::*;
pub use symbols::*;
pub use tracer::{RealAllocator, Totals, Tracer, TracerState};
