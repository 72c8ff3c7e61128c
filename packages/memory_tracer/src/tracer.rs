//! The tracer context: lifecycle, the consumer thread and the interception entry points.

use std::alloc::{GlobalAlloc, Layout};
use std::fmt;
use std::mem;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::bootstrap::BookkeepingScope;
use crate::channel::OperationChannel;
use crate::command::Command;
use crate::{AggregationStore, SnapshotReport, StackBackend, SymbolBackend, TracerBuilder};

/// The allocator that serves the application's blocks, as opposed to the tracer's own storage.
pub type RealAllocator = &'static (dyn GlobalAlloc + Send + Sync);

// How long the consumer sleeps once spinning and yielding found nothing to do. Stopping the
// tracer unparks the consumer, so this only bounds how late freshly queued work is noticed.
const IDLE_PARK: Duration = Duration::from_millis(1);

const CONSUMER_THREAD_NAME: &str = "memory-tracer";

/// Where a [`Tracer`] is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TracerState {
    /// Ready to trace, but not tracing. Allocations pass through unrecorded.
    Initialized,

    /// Allocations and frees are being recorded and a consumer thread is applying them.
    Tracing,

    /// `stop()` is waiting for the consumer thread to apply everything queued before it.
    Stopping,

    /// All resources have been released. The tracer never traces again.
    Finalized,
}

/// Live memory totals across all call sites.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Totals {
    /// Sum of the sizes of all live traced blocks.
    pub bytes: u64,

    /// Number of live traced blocks.
    pub count: u64,
}

enum Lifecycle {
    Initialized { store: AggregationStore },
    Tracing { consumer: JoinHandle<AggregationStore> },
    Stopping,
    Finalized,
}

struct TracerInner {
    allocator: RealAllocator,
    stacks: Box<dyn StackBackend>,
    symbols: Box<dyn SymbolBackend>,
    symbols_available: bool,
    skip_frames: usize,
    max_frames: usize,

    // Written only by the lifecycle operations, read by every allocating thread.
    is_tracing: AtomicBool,

    // Set when the bootstrap allocator failed us. Cleared by the next `start()`.
    faulted: AtomicBool,

    // Fallback for when even the `Stop` sentinel cannot be queued: the consumer exits the next
    // time it finds the channel empty.
    stop_requested: AtomicBool,

    channel: OperationChannel,

    // Shared with every queued snapshot request, so requesting a snapshot does not allocate.
    report_dir: Mutex<Arc<Path>>,
    next_snapshot_index: AtomicU64,

    // Mirrors of the store counters, published by the consumer after every command.
    total_bytes: AtomicU64,
    total_count: AtomicU64,

    lifecycle: Mutex<Lifecycle>,

    // Signaled whenever a `stop()` leaves the `Stopping` state.
    stopped: Condvar,
}

impl TracerInner {
    /// Queues a command, disabling tracing if the bootstrap allocator is exhausted.
    fn enqueue(&self, command: Command) -> bool {
        let Err(command) = self.channel.push(command) else {
            return true;
        };

        if !self.faulted.swap(true, Ordering::AcqRel) {
            self.is_tracing.store(false, Ordering::Release);
            error!(
                command = command.kind(),
                "bootstrap allocator exhausted, memory tracing disabled until restarted"
            );
        }

        false
    }

    fn publish_totals(&self, store: &AggregationStore) {
        // Relaxed is sufficient: readers either accept a momentary view or synchronize with
        // the consumer through `JoinHandle::join()` in `stop()`.
        self.total_bytes.store(store.total_bytes(), Ordering::Relaxed);
        self.total_count.store(store.total_count(), Ordering::Relaxed);
    }

    fn write_snapshot(&self, store: &AggregationStore, dir: &Path) {
        let index = self.next_snapshot_index.fetch_add(1, Ordering::Relaxed);

        let symbols = self.symbols_available.then_some(self.symbols.as_ref());
        let report = SnapshotReport::from_store(store, symbols);

        match report.write_to_dir(dir, index) {
            Ok(path) => info!(
                index,
                path = %path.display(),
                sites = store.site_count(),
                "memory snapshot written"
            ),
            Err(error) => error!(index, %error, "memory snapshot abandoned"),
        }
    }

    fn join_consumer(&self, consumer: JoinHandle<AggregationStore>) -> AggregationStore {
        if !self.enqueue(Command::Stop) {
            self.stop_requested.store(true, Ordering::Release);
        }

        // The consumer may be parked waiting for work.
        consumer.thread().unpark();

        match consumer.join() {
            Ok(store) => store,
            // The consumer only runs our own code, so a panic there is a bug in the tracer.
            // We propagate it to ensure this critical failure is not silently ignored.
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

/// An allocation tracer: records every allocation and free passed through it, aggregates live
/// memory by call site and writes ranked snapshot reports on request.
///
/// The allocating threads only capture a call stack and queue a command. A single consumer thread,
/// running while the tracer is tracing, applies those commands to an [`AggregationStore`] in queue
/// order and writes reports when it reaches a snapshot request. A snapshot therefore reflects
/// exactly the allocations and frees queued before it was requested.
///
/// Most programs use the process-wide tracer through [`Allocator`][crate::Allocator] and the free
/// functions such as [`start()`][crate::start]. A `Tracer` can also be created directly, with
/// custom backends, which is what tests do.
///
/// Dropping a `Tracer` finalizes it.
///
/// # Examples
///
/// ```rust
/// use std::alloc::Layout;
///
/// use memory_tracer::Tracer;
///
/// let reports = tempfile::tempdir().unwrap();
///
/// let tracer = Tracer::builder().report_dir(reports.path()).build();
/// tracer.start();
///
/// let layout = Layout::from_size_align(100, 8).unwrap();
/// // SAFETY: The layout has a non-zero size.
/// let block = unsafe { tracer.add_allocation(layout) };
///
/// tracer.take_snapshot();
///
/// // SAFETY: The block came from `add_allocation()` with the same layout.
/// unsafe { tracer.remove_allocation(block, layout) };
///
/// // Waits until the snapshot above has been written.
/// tracer.stop();
///
/// assert!(reports.path().join("MemoryTracer_Report #0.txt").exists());
/// ```
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// Creates a tracer with default settings.
    ///
    /// Use [`Tracer::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring a tracer.
    #[must_use]
    pub fn builder() -> TracerBuilder {
        TracerBuilder::new()
    }

    pub(crate) fn from_builder(builder: TracerBuilder) -> Self {
        let _scope = BookkeepingScope::enter();

        let symbols_available = match builder.symbols.initialize() {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "memory snapshots will show raw addresses");
                false
            }
        };

        debug!(
            report_dir = %builder.report_dir.display(),
            skip_frames = builder.skip_frames,
            max_frames = builder.max_frames,
            symbols_available,
            "memory tracer initialized"
        );

        Self {
            inner: Arc::new(TracerInner {
                allocator: builder.allocator,
                stacks: builder.stacks,
                symbols: builder.symbols,
                symbols_available,
                skip_frames: builder.skip_frames,
                max_frames: builder.max_frames,
                is_tracing: AtomicBool::new(false),
                faulted: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                channel: OperationChannel::new(),
                report_dir: Mutex::new(Arc::from(builder.report_dir)),
                next_snapshot_index: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
                total_count: AtomicU64::new(0),
                lifecycle: Mutex::new(Lifecycle::Initialized {
                    store: AggregationStore::new(),
                }),
                stopped: Condvar::new(),
            }),
        }
    }

    /// Starts recording allocations and frees.
    ///
    /// Spawns the consumer thread. Does nothing if the tracer is already tracing, is being
    /// stopped or has been finalized.
    ///
    /// # Panics
    ///
    /// Panics if the consumer thread cannot be spawned.
    pub fn start(&self) {
        let _scope = BookkeepingScope::enter();

        let mut lifecycle = self.inner.lifecycle.lock();

        let store = match mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
            Lifecycle::Initialized { store } => store,
            Lifecycle::Finalized => {
                *lifecycle = Lifecycle::Finalized;
                warn!("memory tracer cannot be started after it has been finalized");
                return;
            }
            other => {
                *lifecycle = other;
                return;
            }
        };

        self.inner.stop_requested.store(false, Ordering::Relaxed);
        self.inner.faulted.store(false, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);

        let consumer = thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.to_string())
            .spawn(move || {
                // Everything this thread does is bookkeeping, for its whole lifetime.
                let _scope = BookkeepingScope::enter();

                debug!("memory tracer consumer started");
                let store = consume(&inner, store);
                debug!("memory tracer consumer exiting");

                store
            })
            .expect("failed to spawn memory tracer consumer thread: thread spawning failure is not supported");

        *lifecycle = Lifecycle::Tracing { consumer };

        // Last, so that nothing is queued before there is a consumer to apply it.
        self.inner.is_tracing.store(true, Ordering::Release);

        info!("memory tracing started");
    }

    /// Stops recording and waits until every command queued so far has been applied.
    ///
    /// Once this returns, all allocations, frees and snapshots recorded before the call are
    /// reflected in the store and in [`totals()`][Self::totals], and every requested report has
    /// been written. If another thread is already stopping the tracer, waits for it to finish.
    /// Does nothing if the tracer is not tracing.
    pub fn stop(&self) {
        let _scope = BookkeepingScope::enter();

        let consumer = {
            let mut lifecycle = self.inner.lifecycle.lock();

            loop {
                match mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                    Lifecycle::Tracing { consumer } => break consumer,
                    Lifecycle::Stopping => self.inner.stopped.wait(&mut lifecycle),
                    other => {
                        *lifecycle = other;
                        return;
                    }
                }
            }
        };

        self.inner.is_tracing.store(false, Ordering::Release);

        let store = self.inner.join_consumer(consumer);

        let mut lifecycle = self.inner.lifecycle.lock();

        // A concurrent `finalize()` may have taken over while we were waiting.
        if matches!(*lifecycle, Lifecycle::Stopping) {
            *lifecycle = Lifecycle::Initialized { store };
        }

        self.inner.stopped.notify_all();
        drop(lifecycle);

        info!("memory tracing stopped");
    }

    /// Requests a snapshot report of the current aggregation state.
    ///
    /// The report is written by the consumer thread once it has applied everything queued
    /// before this call, to `MemoryTracer_Report #<n>.txt` in the report directory. Failure to
    /// write it is logged and otherwise ignored. Does nothing if the tracer is not tracing.
    pub fn take_snapshot(&self) {
        let _scope = BookkeepingScope::enter();

        if !self.is_tracing() {
            debug!("memory snapshot ignored because tracing is not active");
            return;
        }

        let report_dir = Arc::clone(&self.inner.report_dir.lock());

        self.inner.enqueue(Command::Snapshot { report_dir });
    }

    /// Stops tracing if necessary and releases everything the tracer holds: the aggregated data,
    /// any commands still queued and the symbol backend.
    ///
    /// The tracer cannot be started again afterwards. Calling this more than once is harmless.
    pub fn finalize(&self) {
        let _scope = BookkeepingScope::enter();

        // Drains the consumer, or waits for a concurrent `stop()` to finish doing so.
        self.stop();

        let previous = mem::replace(&mut *self.inner.lifecycle.lock(), Lifecycle::Finalized);

        match previous {
            Lifecycle::Finalized => return,
            Lifecycle::Initialized { store } => drop(store),
            // Restarted by another thread since we stopped it above.
            Lifecycle::Tracing { consumer } => {
                self.inner.is_tracing.store(false, Ordering::Release);
                drop(self.inner.join_consumer(consumer));
            }
            // The stopping thread will see that we took over and drop the store itself.
            Lifecycle::Stopping => {}
        }

        // Blocks until any consumer still running has exited. Whatever is left was queued after
        // tracing was switched off and has nobody to apply it.
        let discarded = self.inner.channel.consumer().discard_pending();

        if self.inner.symbols_available {
            self.inner.symbols.release();
        }

        self.inner.total_bytes.store(0, Ordering::Relaxed);
        self.inner.total_count.store(0, Ordering::Relaxed);

        info!(discarded, "memory tracer finalized");
    }

    /// Sets the directory that snapshot reports are written to.
    ///
    /// Takes effect for snapshots requested after this call. Snapshots already requested are
    /// written to the directory that was set when they were requested. The directory is created
    /// when the next report is written.
    pub fn set_report_path(&self, path: impl Into<PathBuf>) {
        let _scope = BookkeepingScope::enter();

        let path: Arc<Path> = Arc::from(path.into());
        let previous = mem::replace(&mut *self.inner.report_dir.lock(), path);

        // Freed outside the lock, but still inside the scope.
        drop(previous);
    }

    /// The directory that snapshot reports are written to.
    #[must_use]
    pub fn report_dir(&self) -> PathBuf {
        self.inner.report_dir.lock().to_path_buf()
    }

    /// Allocates a block from the real allocator and, if tracing, records it together with the
    /// call stack of the caller.
    ///
    /// The block is returned even if recording fails.
    ///
    /// # Safety
    ///
    /// The same as [`GlobalAlloc::alloc()`]: `layout` must have a non-zero size.
    #[must_use]
    pub unsafe fn add_allocation(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        let ptr = unsafe { self.inner.allocator.alloc(layout) };

        if !ptr.is_null() {
            self.record_allocation(ptr.addr(), layout.size());
        }

        ptr
    }

    /// If tracing, records that a block is being freed, then returns it to the real allocator.
    ///
    /// # Safety
    ///
    /// The same as [`GlobalAlloc::dealloc()`]: `ptr` must have been returned by
    /// [`add_allocation()`][Self::add_allocation] of this tracer with the same `layout`.
    pub unsafe fn remove_allocation(&self, ptr: *mut u8, layout: Layout) {
        // Recorded before the real free: once the block is released its address may be handed
        // out again, and the new owner's allocation must be queued after this free.
        self.record_free(ptr.addr());

        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.inner.allocator.dealloc(ptr, layout) };
    }

    /// Records a block that the caller obtained from its own allocator.
    pub(crate) fn record_allocation(&self, address: usize, size: usize) {
        if !self.is_tracing() {
            return;
        }

        // Reentrant calls come from the tracer's own bookkeeping and are not recorded.
        let Some(_scope) = BookkeepingScope::enter() else {
            return;
        };

        let stack = self
            .inner
            .stacks
            .capture(self.inner.skip_frames, self.inner.max_frames);

        self.inner.enqueue(Command::Allocate {
            address,
            size,
            stack,
        });
    }

    /// Records that the caller is about to return a block to its own allocator.
    ///
    /// Whether the block is known to the tracer is only checked by the consumer.
    pub(crate) fn record_free(&self, address: usize) {
        if !self.is_tracing() {
            return;
        }

        let Some(_scope) = BookkeepingScope::enter() else {
            return;
        };

        self.inner.enqueue(Command::Free { address });
    }

    /// Whether allocations are currently being recorded.
    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.inner.is_tracing.load(Ordering::Acquire)
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TracerState {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Initialized { .. } => TracerState::Initialized,
            Lifecycle::Tracing { .. } => TracerState::Tracing,
            Lifecycle::Stopping => TracerState::Stopping,
            Lifecycle::Finalized => TracerState::Finalized,
        }
    }

    /// Live memory totals as of the last command the consumer applied.
    ///
    /// Exact for everything recorded before the last [`stop()`][Self::stop].
    #[must_use]
    pub fn totals(&self) -> Totals {
        Totals {
            bytes: self.inner.total_bytes.load(Ordering::Relaxed),
            count: self.inner.total_count.load(Ordering::Relaxed),
        }
    }

    /// The number of snapshots processed so far, which is also the index of the next report.
    #[must_use]
    pub fn snapshots_taken(&self) -> u64 {
        self.inner.next_snapshot_index.load(Ordering::Relaxed)
    }

    /// Calls `f` with the aggregation store, if the tracer is neither tracing nor finalized.
    ///
    /// While tracing, the store belongs to the consumer thread and `None` is returned.
    pub fn inspect_store<R>(&self, f: impl FnOnce(&AggregationStore) -> R) -> Option<R> {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Initialized { store } => Some(f(store)),
            _ => None,
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("state", &self.state())
            .field("totals", &self.totals())
            .field("report_dir", &self.report_dir())
            .field("stacks", &self.inner.stacks)
            .field("symbols", &self.inner.symbols)
            .field("symbols_available", &self.inner.symbols_available)
            .finish_non_exhaustive()
    }
}

fn consume(inner: &TracerInner, mut store: AggregationStore) -> AggregationStore {
    let mut consumer = inner.channel.consumer();
    let backoff = Backoff::new();

    loop {
        let Some(command) = consumer.try_pop() else {
            // Acquire pairs with the Release in `join_consumer()`.
            if inner.stop_requested.load(Ordering::Acquire) {
                break;
            }

            wait_for_work(&backoff);
            continue;
        };

        backoff.reset();

        match command {
            Command::Allocate {
                address,
                size,
                stack,
            } => store.apply_allocate(address, size, stack),
            Command::Free { address } => store.apply_free(address),
            Command::Snapshot { report_dir } => inner.write_snapshot(&store, &report_dir),
            Command::Stop => break,
        }

        inner.publish_totals(&store);
    }

    store
}

#[cfg_attr(test, mutants::skip)] // Only affects how much CPU an idle consumer burns.
fn wait_for_work(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::park_timeout(IDLE_PARK);
    } else {
        backoff.snooze();
    }
}
