//! Snapshot reports: live memory per call site, ranked by volume.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{AggregateEntry, AggregationStore, Error, ResolvedFrame, Result, SymbolBackend};

/// The entire body of a report taken while no traced blocks are live.
pub const EMPTY_REPORT: &str = "Don't have any memory allocations.";

const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;

/// The file name of the report with the given snapshot index.
///
/// # Examples
///
/// ```rust
/// assert_eq!(
///     memory_tracer::report_file_name(3),
///     "MemoryTracer_Report #3.txt"
/// );
/// ```
#[must_use]
pub fn report_file_name(index: u64) -> String {
    format!("MemoryTracer_Report #{index}.txt")
}

/// A rendered view of an [`AggregationStore`], one block per call site, largest first.
///
/// Symbols are resolved when the report is created, so the report is independent of the store
/// afterwards. Its [`Display`][fmt::Display] output is the text written to report files:
///
/// ```text
/// ------- 0.25 MB / 2 times -------
/// 0x000055d0c2a1b2c3 - my_app::load_assets : src/assets.rs (42)
/// 0x000055d0c2a1a000 - my_app::main : src/main.rs (7)
/// ```
#[derive(Clone, Debug)]
pub struct SnapshotReport {
    blocks: Vec<ReportBlock>,
}

#[derive(Clone, Debug)]
struct ReportBlock {
    total_bytes: u64,
    live_count: u64,
    frames: Vec<FrameLine>,
}

#[derive(Clone, Debug)]
enum FrameLine {
    Resolved { address: usize, frame: ResolvedFrame },
    Unresolved { address: usize },
    // Symbol resolution is unavailable in this process.
    Raw { address: usize },
}

impl SnapshotReport {
    /// Builds a report from the current state of `store`.
    ///
    /// With `symbols` set to `None` every frame is shown as a raw address. Frames the backend
    /// cannot resolve are shown with a placeholder instead of a name.
    #[must_use]
    pub fn from_store(store: &AggregationStore, symbols: Option<&dyn SymbolBackend>) -> Self {
        let mut entries = store.entries().collect::<Vec<_>>();

        // Ties are broken by fingerprint so the order does not depend on map iteration order.
        entries.sort_by(|a, b| {
            b.total_bytes()
                .cmp(&a.total_bytes())
                .then_with(|| a.stack().stack_hash().cmp(&b.stack().stack_hash()))
        });

        Self {
            blocks: entries
                .into_iter()
                .map(|entry| ReportBlock::new(entry, symbols))
                .collect(),
        }
    }

    /// Whether the report has no call sites, i.e. consists only of [`EMPTY_REPORT`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Writes the report to `MemoryTracer_Report #<index>.txt` in `dir`, creating `dir` first if
    /// it does not exist. Returns the path of the written file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReportIo`] if the directory cannot be created or the file cannot be
    /// written.
    pub fn write_to_dir(&self, dir: &Path, index: u64) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|source| Error::ReportIo {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(report_file_name(index));

        fs::write(&path, self.to_string()).map_err(|source| Error::ReportIo {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }
}

impl fmt::Display for SnapshotReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.blocks.is_empty() {
            return write!(f, "{EMPTY_REPORT}");
        }

        for block in &self.blocks {
            write!(f, "{block}")?;
        }

        Ok(())
    }
}

impl ReportBlock {
    fn new(entry: &AggregateEntry, symbols: Option<&dyn SymbolBackend>) -> Self {
        let frames = entry
            .stack()
            .frames()
            .iter()
            .map(|&address| match symbols {
                None => FrameLine::Raw { address },
                Some(symbols) => match symbols.resolve(address) {
                    Ok(frame) => FrameLine::Resolved { address, frame },
                    Err(_) => FrameLine::Unresolved { address },
                },
            })
            .collect();

        Self {
            total_bytes: entry.total_bytes(),
            live_count: entry.live_count(),
            frames,
        }
    }
}

impl fmt::Display for ReportBlock {
    #[expect(
        clippy::cast_precision_loss,
        reason = "megabytes with two decimals do not need more than 52 bits of precision"
    )]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let megabytes = self.total_bytes as f64 / BYTES_PER_MEGABYTE;

        writeln!(
            f,
            "------- {megabytes:.2} MB / {} times -------",
            self.live_count
        )?;

        for frame in &self.frames {
            writeln!(f, "{frame}")?;
        }

        Ok(())
    }
}

impl fmt::Display for FrameLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved { address, frame } => write!(
                f,
                "{address:#018x} - {} : {} ({})",
                frame.name, frame.file, frame.line
            ),
            Self::Unresolved { address } => write!(f, "{address:#018x} - <unresolved symbol>"),
            Self::Raw { address } => write!(f, "{address:#018x}"),
        }
    }
}
