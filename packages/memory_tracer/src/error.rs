use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving symbols or writing snapshot reports.
///
/// None of these errors interrupt tracing. The tracer logs them and carries on, either in a
/// degraded mode (symbol problems) or by abandoning the affected snapshot (I/O problems).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The symbol resolution backend could not be brought up.
    ///
    /// Snapshot reports fall back to raw return addresses when this happens.
    #[error("symbol resolution backend is unavailable: {reason}")]
    SymbolBackendUnavailable {
        /// A human-readable description of why the backend could not be initialized.
        reason: String,
    },

    /// The symbol resolution backend has no information about a return address.
    #[error("no symbol information for address {address:#x}")]
    SymbolNotFound {
        /// The return address that could not be resolved.
        address: usize,
    },

    /// A snapshot report could not be written to disk.
    #[error("failed to write snapshot report '{}': {source}", path.display())]
    ReportIo {
        /// The directory or file the tracer was operating on when the failure occurred.
        path: PathBuf,

        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// A specialized `Result` type for tracer operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::error::Error as _;
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn symbol_not_found_formats_address_as_hex() {
        let error = Error::SymbolNotFound { address: 0xbeef };

        assert_eq!(error.to_string(), "no symbol information for address 0xbeef");
    }

    #[test]
    fn report_io_exposes_source() {
        let error = Error::ReportIo {
            path: PathBuf::from("reports"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };

        assert!(error.to_string().contains("reports"));
        assert!(error.source().is_some());
    }
}
