//! Aggregation of live allocations by call site.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use foldhash::fast::RandomState;

use crate::{CallStack, StackHash};

/// The record kept for one live (allocated, not yet freed) block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LiveAllocation {
    /// The size of the block in bytes.
    pub size: usize,

    /// The fingerprint of the call stack that allocated the block.
    pub stack_hash: StackHash,
}

/// Live memory attributed to one call site.
///
/// An entry exists exactly as long as at least one block allocated from its call site is live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AggregateEntry {
    total_bytes: u64,
    live_count: u64,
    stack: CallStack,
}

impl AggregateEntry {
    fn new(stack: CallStack) -> Self {
        Self {
            total_bytes: 0,
            live_count: 0,
            stack,
        }
    }

    /// Sum of the sizes of all live blocks allocated from this call site.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of live blocks allocated from this call site.
    #[must_use]
    pub fn live_count(&self) -> u64 {
        self.live_count
    }

    /// The call stack of the first allocation seen from this call site.
    #[must_use]
    pub fn stack(&self) -> &CallStack {
        &self.stack
    }
}

/// The tracer's view of live memory, keyed both by address and by call site.
///
/// Only the consumer thread mutates a store, which is why it carries no synchronization of its
/// own. After every applied command the global counters equal the sums over all entries.
#[derive(Clone, Debug)]
pub struct AggregationStore {
    live: HashMap<usize, LiveAllocation, RandomState>,
    sites: HashMap<StackHash, AggregateEntry, RandomState>,
    total_bytes: u64,
    total_count: u64,
}

impl AggregationStore {
    pub(crate) fn new() -> Self {
        Self {
            live: HashMap::with_hasher(RandomState::default()),
            sites: HashMap::with_hasher(RandomState::default()),
            total_bytes: 0,
            total_count: 0,
        }
    }

    /// Records a block handed out at `address`.
    ///
    /// A record already present for `address` is retired first. The real allocator only reuses
    /// an address after it was freed, so such a record means the matching free was never seen.
    pub(crate) fn apply_allocate(&mut self, address: usize, size: usize, stack: CallStack) {
        let stack_hash = stack.stack_hash();

        if let Some(previous) = self.live.insert(address, LiveAllocation { size, stack_hash }) {
            self.retire(previous);
        }

        // An already known call site keeps its canonical stack; the new capture is dropped here.
        let entry = self
            .sites
            .entry(stack_hash)
            .or_insert_with(|| AggregateEntry::new(stack));

        // Never going to overflow u64, so no point doing slower checked arithmetic here.
        let size = size as u64;
        entry.total_bytes = entry.total_bytes.wrapping_add(size);
        entry.live_count = entry.live_count.wrapping_add(1);

        self.total_bytes = self.total_bytes.wrapping_add(size);
        self.total_count = self.total_count.wrapping_add(1);
    }

    /// Records that the block at `address` was freed.
    ///
    /// Unknown addresses are ignored: they were allocated before tracing started or have
    /// already been freed.
    pub(crate) fn apply_free(&mut self, address: usize) {
        if let Some(allocation) = self.live.remove(&address) {
            self.retire(allocation);
        }
    }

    // Removes the contribution of an allocation that is no longer in `live`.
    fn retire(&mut self, allocation: LiveAllocation) {
        let size = allocation.size as u64;

        match self.sites.entry(allocation.stack_hash) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();

                debug_assert!(entry.live_count > 0 && entry.total_bytes >= size);
                entry.live_count = entry.live_count.wrapping_sub(1);
                entry.total_bytes = entry.total_bytes.wrapping_sub(size);

                if entry.live_count == 0 {
                    occupied.remove();
                }
            }
            Entry::Vacant(_) => {
                debug_assert!(false, "live allocation refers to a missing call site");
                return;
            }
        }

        self.total_bytes = self.total_bytes.wrapping_sub(size);
        self.total_count = self.total_count.wrapping_sub(1);
    }

    /// Sum of the sizes of all live blocks.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of live blocks.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Number of distinct call sites with live blocks.
    #[must_use]
    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// The record for the live block at `address`, if any.
    #[must_use]
    pub fn live_allocation(&self, address: usize) -> Option<&LiveAllocation> {
        self.live.get(&address)
    }

    /// The entry for the call site with the given fingerprint, if it has live blocks.
    #[must_use]
    pub fn entry(&self, stack_hash: StackHash) -> Option<&AggregateEntry> {
        self.sites.get(&stack_hash)
    }

    /// All call sites with live blocks, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &AggregateEntry> {
        self.sites.values()
    }

    /// Whether no blocks are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
