//! Symbol resolution for captured return addresses.

use std::ffi::c_void;
use std::fmt;
use std::ptr;

use crate::{Error, Result};

/// Human-readable location of a single return address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedFrame {
    /// The (demangled) name of the function containing the address.
    pub name: String,

    /// The source file of the function, or `<unknown file>` if debug info has no file.
    pub file: String,

    /// The source line, or 0 if debug info has no line.
    pub line: u32,
}

/// Translates return addresses into function names and source locations.
///
/// Resolution only ever happens on the tracer's consumer thread while a snapshot report is being
/// produced, never on the allocation path.
pub trait SymbolBackend: fmt::Debug + Send + Sync + 'static {
    /// Prepares the backend for use. Called once when the tracer is created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SymbolBackendUnavailable`] if symbols cannot be resolved in this process.
    /// The tracer keeps running and reports raw addresses instead.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Resolves a single return address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SymbolNotFound`] if nothing is known about the address.
    fn resolve(&self, address: usize) -> Result<ResolvedFrame>;

    /// Releases whatever [`initialize()`][Self::initialize] acquired. Called once when the
    /// tracer is finalized.
    fn release(&self) {}
}

/// Resolves symbols from the debug information of the running process via the `backtrace`
/// crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceSymbolBackend;

impl SymbolBackend for BacktraceSymbolBackend {
    fn resolve(&self, address: usize) -> Result<ResolvedFrame> {
        let mut name = None;
        let mut file = None;
        let mut line = None;

        backtrace::resolve(ptr::without_provenance_mut::<c_void>(address), |symbol| {
            if name.is_none() {
                name = symbol.name().map(|n| n.to_string());
            }

            if file.is_none() {
                file = symbol.filename().map(|path| path.display().to_string());
            }

            if line.is_none() {
                line = symbol.lineno();
            }
        });

        if name.is_none() && file.is_none() {
            return Err(Error::SymbolNotFound { address });
        }

        Ok(ResolvedFrame {
            name: name.unwrap_or_else(|| "<unknown function>".to_string()),
            file: file.unwrap_or_else(|| "<unknown file>".to_string()),
            line: line.unwrap_or(0),
        })
    }
}
