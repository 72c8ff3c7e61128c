//! Multi-producer, single-consumer queue of commands stored in bootstrap memory.
//!
//! This is an intrusive linked queue in the style of Dmitry Vyukov's MPSC queue. Producers
//! publish a node with a single atomic swap of the head pointer, which is also the point that
//! defines the queue order. The consumer follows `next` links from a stub node at the tail.
//!
//! Every node lives in memory obtained from [`BootstrapAllocator`], so pushing from inside the
//! global allocator never re-enters it.

use std::alloc::{Layout, handle_alloc_error};
use std::fmt;
use std::ptr::{self, NonNull};
#[cfg(test)]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::BootstrapAllocator;
use crate::command::Command;

struct Node {
    next: AtomicPtr<Node>,

    // `None` only for the stub node the consumer currently stands on.
    command: Option<Command>,
}

impl Node {
    fn new(command: Option<Command>) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            command,
        }
    }
}

// The consumer-owned tail node. Only ever reached through the mutex in `OperationChannel`.
struct Tail(NonNull<Node>);

// SAFETY: The node behind the pointer is owned by whichever thread holds the tail mutex, and the
// only concurrent access from producers goes through the atomic `next` field.
unsafe impl Send for Tail {}

/// The queue that carries commands from allocating threads to the consumer thread.
pub(crate) struct OperationChannel {
    // The most recently pushed node. Producers swap themselves in here.
    head: AtomicPtr<Node>,

    // The most recently consumed node. Holding this lock is what makes a thread "the consumer".
    tail: Mutex<Tail>,

    // Makes every node allocation fail, as if the bootstrap allocator were exhausted.
    #[cfg(test)]
    exhausted: AtomicBool,
}

impl OperationChannel {
    pub(crate) fn new() -> Self {
        let Some(stub) = BootstrapAllocator::allocate(Node::new(None)) else {
            handle_alloc_error(Layout::new::<Node>());
        };

        Self {
            head: AtomicPtr::new(stub.as_ptr()),
            tail: Mutex::new(Tail(stub)),
            #[cfg(test)]
            exhausted: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Relaxed);
    }

    /// Appends a command. Never blocks and is safe to call from any number of threads.
    ///
    /// Hands the command back if the bootstrap allocator could not provide storage for it.
    pub(crate) fn push(&self, command: Command) -> Result<(), Command> {
        #[cfg(test)]
        if self.exhausted.load(Ordering::Relaxed) {
            return Err(command);
        }

        let Some(node) = BootstrapAllocator::allocate(Node::new(Some(command))) else {
            return Err(command);
        };

        // AcqRel: Release publishes the node contents to whoever swaps after us; Acquire makes the
        // previous node (published the same way) safe to touch below.
        let previous = self.head.swap(node.as_ptr(), Ordering::AcqRel);

        // SAFETY: The consumer never frees a node whose `next` is still null, and `previous` only
        // gets a non-null `next` through this very store, so it is alive until we are done.
        unsafe {
            (*previous).next.store(node.as_ptr(), Ordering::Release);
        }

        Ok(())
    }

    /// Claims the consumer side of the channel.
    ///
    /// Only one consumer can exist at a time; a second caller blocks until the first is dropped.
    pub(crate) fn consumer(&self) -> Consumer<'_> {
        Consumer {
            tail: self.tail.lock(),
        }
    }
}

impl fmt::Debug for OperationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationChannel").finish_non_exhaustive()
    }
}

impl Drop for OperationChannel {
    fn drop(&mut self) {
        let tail = &mut self.tail.get_mut().0;

        while pop(tail).is_some() {}

        // SAFETY: With exclusive access there are no producers left, so the final stub node is
        // referenced by nobody else and came from `BootstrapAllocator::allocate()`.
        drop(unsafe { BootstrapAllocator::release(*tail) });
    }
}

/// Exclusive access to the receiving end of an [`OperationChannel`].
pub(crate) struct Consumer<'a> {
    tail: MutexGuard<'a, Tail>,
}

impl Consumer<'_> {
    /// Takes the oldest command, or returns `None` if there is nothing to take right now.
    ///
    /// `None` is also returned while a producer is between its swap and its link store; the
    /// command becomes visible on a later call.
    pub(crate) fn try_pop(&mut self) -> Option<Command> {
        pop(&mut self.tail.0)
    }

    /// Discards everything currently queued, returning how many commands were dropped.
    pub(crate) fn discard_pending(&mut self) -> usize {
        let mut discarded = 0_usize;

        while self.try_pop().is_some() {
            discarded = discarded.wrapping_add(1);
        }

        discarded
    }
}

impl fmt::Debug for Consumer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

fn pop(tail: &mut NonNull<Node>) -> Option<Command> {
    let current = *tail;

    // SAFETY: The tail node is alive and owned by the caller, who has exclusive consumer access.
    // Acquire pairs with the Release link store in `push()`, making the node contents visible.
    let next = unsafe { current.as_ref() }.next.load(Ordering::Acquire);
    let next = NonNull::new(next)?;

    *tail = next;

    // SAFETY: `next` is fully published (see above) and from now on it is the consumer's stub.
    // Producers only ever touch its atomic `next` field, so borrowing the command field alone
    // does not alias with them.
    let command = unsafe { (*next.as_ptr()).command.take() };

    // SAFETY: `current` has a non-null `next`, so no producer will touch it again, and the tail
    // has moved on so the consumer will not either. It came from `BootstrapAllocator::allocate()`.
    drop(unsafe { BootstrapAllocator::release(current) });

    command
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    static_assertions::assert_impl_all!(OperationChannel: Send, Sync);

    fn free(address: usize) -> Command {
        Command::Free { address }
    }

    #[test]
    fn empty_channel_pops_nothing() {
        let channel = OperationChannel::new();

        assert_eq!(channel.consumer().try_pop(), None);
    }

    #[test]
    fn single_producer_is_fifo() {
        let channel = OperationChannel::new();

        for address in 1..=5 {
            channel.push(free(address)).unwrap();
        }
        channel.push(Command::Stop).unwrap();

        let mut consumer = channel.consumer();

        for address in 1..=5 {
            assert_eq!(consumer.try_pop(), Some(free(address)));
        }
        assert_eq!(consumer.try_pop(), Some(Command::Stop));
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn interleaved_push_and_pop() {
        let channel = OperationChannel::new();
        let mut consumer = channel.consumer();

        channel.push(free(1)).unwrap();
        assert_eq!(consumer.try_pop(), Some(free(1)));
        assert_eq!(consumer.try_pop(), None);

        channel.push(free(2)).unwrap();
        channel.push(free(3)).unwrap();
        assert_eq!(consumer.try_pop(), Some(free(2)));
        assert_eq!(consumer.try_pop(), Some(free(3)));
    }

    #[test]
    fn discard_pending_counts_dropped_commands() {
        let channel = OperationChannel::new();

        channel
            .push(Command::Snapshot {
                report_dir: Arc::from(Path::new("reports")),
            })
            .unwrap();
        channel.push(free(9)).unwrap();

        let mut consumer = channel.consumer();
        assert_eq!(consumer.discard_pending(), 2);
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn exhausted_channel_hands_command_back() {
        let channel = OperationChannel::new();
        channel.set_exhausted(true);

        assert_eq!(channel.push(free(1)), Err(free(1)));
        assert_eq!(channel.consumer().try_pop(), None);

        channel.set_exhausted(false);
        channel.push(free(2)).unwrap();
        assert_eq!(channel.consumer().try_pop(), Some(free(2)));
    }

    #[test]
    fn dropping_with_pending_commands_releases_them() {
        let channel = OperationChannel::new();

        for address in 0..16 {
            channel.push(free(address)).unwrap();
        }

        // Under Miri, a leaked node would be reported here.
        drop(channel);
    }

    #[cfg_attr(miri, ignore)] // Too slow under Miri at this volume.
    #[test]
    fn concurrent_producers_keep_their_own_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let channel = Arc::new(OperationChannel::new());

        let producers = (0..PRODUCERS)
            .map(|producer| {
                let channel = Arc::clone(&channel);

                thread::spawn(move || {
                    for sequence in 0..PER_PRODUCER {
                        // Encode the producer in the high part so order can be checked per
                        // producer on the receiving side.
                        channel
                            .push(free(producer * PER_PRODUCER * 10 + sequence))
                            .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut consumer = channel.consumer();
        let mut last_seen = [None::<usize>; PRODUCERS];
        let mut received = 0_usize;

        while let Some(command) = consumer.try_pop() {
            let Command::Free { address } = command else {
                panic!("unexpected command {command:?}");
            };

            let producer = address / (PER_PRODUCER * 10);
            let sequence = address % (PER_PRODUCER * 10);

            if let Some(previous) = last_seen[producer] {
                assert!(sequence > previous, "producer {producer} order violated");
            }
            last_seen[producer] = Some(sequence);
            received += 1;
        }

        assert_eq!(received, PRODUCERS * PER_PRODUCER);
    }
}
