use std::fs;
use std::path::{Path, PathBuf};

use super::Exporter;
use crate::error::ExportError;
use crate::session::LogRow;

/// One CSV row per log row, header = log column names.
pub struct CsvExporter;

impl CsvExporter {
    pub fn write<W: std::io::Write>(rows: &[LogRow], out: W) -> Result<(), ExportError> {
        let mut w = csv::Writer::from_writer(out);
        for row in rows {
            w.serialize(row)?;
        }
        w.flush()?;
        Ok(())
    }
}

impl Exporter for CsvExporter {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn export(&self, rows: &[LogRow], dir: &Path, session: &str) -> Result<PathBuf, ExportError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{session}.csv"));
        Self::write(rows, fs::File::create(&path)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::tests::row;

    #[test]
    fn test_header_and_empty_cells() {
        let mut r = row(0, 1, 1);
        r.heart_rate = Some(128.0);
        let mut buf = Vec::new();
        CsvExporter::write(&[r], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        let leading = "timestamp,lap,timer,total_timer_time,position_lat,position_long";
        assert!(header.starts_with(leading));
        assert!(header.ends_with("avg_power_count,avg_power_sum"));
        assert_eq!(header.split(',').count(), 56);
        let fields: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(fields[1], "0");
        assert_eq!(fields[4], "");
        assert_eq!(fields[12], "128.0");
    }

    #[test]
    fn test_export_names_file_after_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = CsvExporter.export(&[row(0, 1, 1)], dir.path(), "2024-05-01_08-00-01").unwrap();
        assert!(path.ends_with("2024-05-01_08-00-01.csv"));
        assert_eq!(fs::read_to_string(path).unwrap().lines().count(), 2);
    }
}
