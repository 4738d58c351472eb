//! Session exporters, run by `reset_count` before the log is archived.

pub mod csv;
pub mod gpx;

use std::path::{Path, PathBuf};

use crate::error::ExportError;
use crate::session::LogRow;

pub use self::csv::CsvExporter;
pub use self::gpx::GpxExporter;

/// Writes a finished session somewhere outside the live log.
pub trait Exporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Export `rows` into `dir`, naming the file after `session`
    /// (the session start, `%Y-%m-%d_%H-%M-%S`). Returns the written path.
    fn export(&self, rows: &[LogRow], dir: &Path, session: &str) -> Result<PathBuf, ExportError>;
}

/// The exporters enabled by the log settings.
pub fn enabled(write_csv: bool, write_gpx: bool) -> Vec<Box<dyn Exporter>> {
    let mut out: Vec<Box<dyn Exporter>> = Vec::new();
    if write_csv {
        out.push(Box::new(CsvExporter));
    }
    if write_gpx {
        out.push(Box::new(GpxExporter));
    }
    out
}
