//! Deterministic stand-ins for the platform backends, for use in unit tests.

use std::cell::Cell;
use std::thread;
use std::time::Duration;

use crate::{CallStack, Error, ResolvedFrame, Result, StackBackend, SymbolBackend};

/// An address that [`SiteSymbols`] refuses to resolve.
pub(crate) const UNRESOLVABLE_ADDRESS: usize = 0xdead;

thread_local! {
    static CURRENT_SITE: Cell<&'static [usize]> = const { Cell::new(&[]) };
}

/// Runs `f` with the calling thread pretending to be at the call site described by `frames`.
pub(crate) fn at_site<R>(frames: &'static [usize], f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_SITE.replace(frames);
    let result = f();
    CURRENT_SITE.set(previous);
    result
}

/// Reports whatever call site the current thread entered via [`at_site()`].
#[derive(Debug, Default)]
pub(crate) struct SiteStacks;

impl StackBackend for SiteStacks {
    fn capture(&self, skip_frames: usize, max_frames: usize) -> CallStack {
        let frames = CURRENT_SITE.get();
        let end = frames.len().min(skip_frames.saturating_add(max_frames));

        CallStack::from_addresses(frames.get(skip_frames..end).unwrap_or_default())
    }
}

/// Resolves every address to a synthetic function named after it, except
/// [`UNRESOLVABLE_ADDRESS`].
#[derive(Debug, Default)]
pub(crate) struct SiteSymbols;

impl SymbolBackend for SiteSymbols {
    fn resolve(&self, address: usize) -> Result<ResolvedFrame> {
        if address == UNRESOLVABLE_ADDRESS {
            return Err(Error::SymbolNotFound { address });
        }

        Ok(ResolvedFrame {
            name: format!("site_{address:x}"),
            file: "sites.rs".to_string(),
            line: u32::try_from(address % 1000).unwrap_or_default(),
        })
    }
}

/// A backend whose initialization always fails.
#[derive(Debug, Default)]
pub(crate) struct BrokenSymbols;

impl SymbolBackend for BrokenSymbols {
    fn initialize(&self) -> Result<()> {
        Err(Error::SymbolBackendUnavailable {
            reason: "no debug information in test".to_string(),
        })
    }

    fn resolve(&self, address: usize) -> Result<ResolvedFrame> {
        Err(Error::SymbolNotFound { address })
    }
}

/// Resolves like [`SiteSymbols`], but takes the given time for every address.
#[derive(Debug)]
pub(crate) struct SlowSymbols(pub(crate) Duration);

impl SymbolBackend for SlowSymbols {
    fn resolve(&self, address: usize) -> Result<ResolvedFrame> {
        thread::sleep(self.0);
        SiteSymbols.resolve(address)
    }
}
