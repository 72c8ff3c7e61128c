//! Units of work carried from allocating threads to the consumer thread.

use std::path::Path;
use std::sync::Arc;

use crate::CallStack;

/// A request for the consumer thread, applied strictly in queue order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Command {
    /// A block was handed out by the real allocator while tracing was active.
    Allocate {
        address: usize,
        size: usize,
        // Carries its own hash. Discarded by the store if the call site is already known.
        stack: CallStack,
    },

    /// A block is about to be returned to the real allocator.
    Free { address: usize },

    /// Write a report of the aggregation state as of this point in the queue.
    Snapshot {
        // The report directory in effect when the snapshot was requested.
        report_dir: Arc<Path>,
    },

    /// Exit the consumer loop. Everything queued before this has been applied once it is seen.
    Stop,
}

impl Command {
    /// Short name for log output.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Allocate { .. } => "allocate",
            Self::Free { .. } => "free",
            Self::Snapshot { .. } => "snapshot",
            Self::Stop => "stop",
        }
    }
}
