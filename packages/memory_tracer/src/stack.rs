//! Bounded call stack capture and call site fingerprints.

use std::fmt;
use std::hash::BuildHasher;

use foldhash::fast::FixedState;

/// The maximum number of return addresses kept for a single call stack.
pub const MAX_FRAMES: usize = 32;

/// The default number of innermost frames excluded from a capture.
///
/// These are the frames of the tracer itself (the capture routine and the interception entry
/// point), which carry no information about where the allocation originated.
pub const DEFAULT_SKIP_FRAMES: usize = 2;

// Fixed so that identical address sequences produce identical fingerprints for the whole
// lifetime of the process, independent of which thread computed them.
const STACK_HASH_SEED: u64 = 0x6d65_6d74_7261_6365;

/// Fingerprint of an ordered return-address sequence, used to group allocations by call site.
pub type StackHash = u64;

/// An ordered sequence of up to [`MAX_FRAMES`] return addresses, innermost first, together with
/// a hash computed over them in order.
///
/// The frames are stored inline, so creating, copying and dropping a `CallStack` never touches
/// the heap. This is what allows stacks to be captured inside the global allocator.
///
/// Two stacks with the same addresses in the same order always have the same hash. An empty
/// stack is a valid value with the hash of the empty sequence.
///
/// # Examples
///
/// ```rust
/// use memory_tracer::CallStack;
///
/// let a = CallStack::from_addresses(&[0x1000, 0x2000]);
/// let b = CallStack::from_addresses(&[0x1000, 0x2000]);
/// let reversed = CallStack::from_addresses(&[0x2000, 0x1000]);
///
/// assert_eq!(a.stack_hash(), b.stack_hash());
/// assert_ne!(a.stack_hash(), reversed.stack_hash());
/// ```
#[derive(Clone, Copy)]
pub struct CallStack {
    frames: [usize; MAX_FRAMES],
    len: usize,
    hash: StackHash,
}

impl CallStack {
    /// Creates a call stack from return addresses ordered innermost first.
    ///
    /// Addresses beyond [`MAX_FRAMES`] are ignored.
    #[must_use]
    pub fn from_addresses(addresses: &[usize]) -> Self {
        let mut frames = [0_usize; MAX_FRAMES];
        let len = addresses.len().min(MAX_FRAMES);

        for (slot, address) in frames.iter_mut().zip(addresses) {
            *slot = *address;
        }

        let mut stack = Self {
            frames,
            len,
            hash: 0,
        };
        stack.hash = hash_frames(stack.frames());
        stack
    }

    /// Creates a call stack with no frames.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_addresses(&[])
    }

    /// The captured return addresses, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        self.frames.get(..self.len).unwrap_or_default()
    }

    /// The fingerprint of this call stack.
    #[must_use]
    pub fn stack_hash(&self) -> StackHash {
        self.hash
    }

    /// The number of captured frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no frames were captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for CallStack {
    fn eq(&self, other: &Self) -> bool {
        self.frames() == other.frames()
    }
}

impl Eq for CallStack {}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStack")
            .field("hash", &format_args!("{:#018x}", self.hash))
            .field("frames", &format_args!("{:#x?}", self.frames()))
            .finish()
    }
}

fn hash_frames(frames: &[usize]) -> StackHash {
    FixedState::with_seed(STACK_HASH_SEED).hash_one(frames)
}

/// Captures the call stack of the current thread.
///
/// Implementations are invoked from inside the global allocator. Any allocation they make is
/// forwarded to the real allocator without being recorded, but they must not block on locks that
/// may be held by code which is itself allocating.
pub trait StackBackend: fmt::Debug + Send + Sync + 'static {
    /// Captures at most `max_frames` return addresses, innermost first, after skipping the
    /// `skip_frames` innermost frames.
    fn capture(&self, skip_frames: usize, max_frames: usize) -> CallStack;
}

/// Captures call stacks by unwinding the current thread with the `backtrace` crate.
///
/// Only raw return addresses are collected here; symbol resolution is deferred until a snapshot
/// report is produced.
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceStackBackend;

impl StackBackend for BacktraceStackBackend {
    // Never inlined, so that the number of tracer frames to skip does not depend on what the
    // optimizer decided to merge into the caller.
    #[inline(never)]
    fn capture(&self, skip_frames: usize, max_frames: usize) -> CallStack {
        let max_frames = max_frames.min(MAX_FRAMES);

        let mut frames = [0_usize; MAX_FRAMES];
        let mut len = 0_usize;
        let mut remaining_skip = skip_frames;

        backtrace::trace(|frame| {
            if remaining_skip > 0 {
                remaining_skip -= 1;
                return true;
            }

            if len >= max_frames {
                return false;
            }

            let Some(slot) = frames.get_mut(len) else {
                return false;
            };

            *slot = frame.ip().addr();
            len = len.wrapping_add(1);

            len < max_frames
        });

        CallStack::from_addresses(frames.get(..len).unwrap_or_default())
    }
}
