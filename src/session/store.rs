//! Append-only row storage.
//!
//! `JsonlLogStore` writes one JSON object per line and syncs after every
//! append. Both stores keep a `LogIndex` (per-lap maxima, last row, last known
//! totals) current on append so resume never has to replay statistics.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::row::LogRow;
use super::stats::{LapValues, StatKey};
use crate::error::LogStoreError;

// ─── Index ───────────────────────────────────────────────────────────────────

/// Aggregates over the counted rows of one lap.
#[derive(Clone, Debug, PartialEq)]
pub struct LapEntry {
    /// Last row appended in this lap
    pub last_row: LogRow,
    /// Maxima of heart rate, cadence, speed and power; 0 when never known
    pub maxima: LapValues,
    /// Last known distance, work and climb totals; 0 when never known
    pub last_totals: LapValues,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogIndex {
    laps: BTreeMap<u32, LapEntry>,
    last: Option<LogRow>,
    first_timestamp: Option<DateTime<Utc>>,
    rows: usize,
    entire_max: LapValues,
    entire_totals: LapValues,
}

impl LogIndex {
    pub fn insert(&mut self, row: &LogRow) {
        self.rows += 1;
        self.first_timestamp.get_or_insert(row.timestamp);
        let entry = self.laps.entry(row.lap).or_insert_with(|| LapEntry {
            last_row: row.clone(),
            maxima: LapValues::default(),
            last_totals: LapValues::default(),
        });
        entry.last_row = row.clone();
        if row.is_tick() {
            for (key, v) in averaged(row) {
                if let Some(v) = v {
                    entry.maxima[key] = entry.maxima[key].max(v);
                    self.entire_max[key] = self.entire_max[key].max(v);
                }
            }
            for (key, v) in totals(row) {
                if let Some(v) = v {
                    entry.last_totals[key] = v;
                    self.entire_totals[key] = v;
                }
            }
        }
        self.last = Some(row.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    /// The most recently appended row.
    pub fn last_row(&self) -> Option<&LogRow> {
        self.last.as_ref()
    }

    pub fn max_lap(&self) -> Option<u32> {
        self.laps.keys().next_back().copied()
    }

    pub fn lap(&self, lap: u32) -> Option<&LapEntry> {
        self.laps.get(&lap)
    }

    /// Maxima over every counted row.
    pub fn entire_max(&self) -> LapValues {
        self.entire_max
    }

    /// Last known totals over every counted row.
    pub fn entire_totals(&self) -> LapValues {
        self.entire_totals
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.first_timestamp
    }
}

fn averaged(row: &LogRow) -> [(StatKey, Option<f64>); 4] {
    [
        (StatKey::HeartRate, row.heart_rate),
        (StatKey::Cadence, row.cadence),
        (StatKey::Speed, row.speed),
        (StatKey::Power, row.power),
    ]
}

fn totals(row: &LogRow) -> [(StatKey, Option<f64>); 4] {
    [
        (StatKey::Distance, Some(row.distance)),
        (StatKey::AccumulatedPower, Some(row.accumulated_power)),
        (StatKey::TotalAscent, row.total_ascent),
        (StatKey::TotalDescent, row.total_descent),
    ]
}

// ─── Store trait ─────────────────────────────────────────────────────────────

pub trait LogStore: Send {
    /// Durably append one row.
    fn append(&mut self, row: &LogRow) -> Result<(), LogStoreError>;

    fn index(&self) -> &LogIndex;

    /// Every row in append order.
    fn read_rows(&self) -> Result<Vec<LogRow>, LogStoreError>;

    /// Move the current log aside under `suffix` and start empty.
    /// Returns where the old log went, if anywhere.
    fn archive(&mut self, suffix: &str) -> Result<Option<PathBuf>, LogStoreError>;
}

// ─── JSON lines ──────────────────────────────────────────────────────────────

pub struct JsonlLogStore {
    path: PathBuf,
    file: File,
    index: LogIndex,
}

impl JsonlLogStore {
    /// Open or create the log at `path` and index its rows.
    ///
    /// A torn final line (crash mid-write) is cut off with a warning. Any
    /// other unparsable line is `LogStoreError::Corrupt`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogStoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut index = LogIndex::default();
        if path.exists() {
            let valid_len = scan(&path, |row| index.insert(&row))?;
            let file_len = fs::metadata(&path)?.len();
            if valid_len < file_len {
                log::warn!(
                    "log store: dropping torn final record ({} bytes) in {}",
                    file_len - valid_len,
                    path.display()
                );
                OpenOptions::new().write(true).open(&path)?.set_len(valid_len)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!("log store: {} ({} rows)", path.display(), index.len());
        Ok(Self { path, file, index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Feed every complete row of `path` to `f`. Returns the byte length of the
/// valid prefix.
fn scan(path: &Path, mut f: impl FnMut(LogRow)) -> Result<u64, LogStoreError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = String::new();
    let mut offset = 0u64;
    let mut line_no = 0usize;
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(offset);
        }
        line_no += 1;
        let complete = line.ends_with('\n');
        let text = line.trim_end();
        if text.is_empty() && complete {
            offset += n as u64;
            continue;
        }
        match serde_json::from_str::<LogRow>(text) {
            Ok(row) if complete => {
                f(row);
                offset += n as u64;
            }
            // no newline: the write never finished
            Ok(_) => return Ok(offset),
            Err(_) if !complete => return Ok(offset),
            Err(e) => return Err(LogStoreError::Corrupt { line: line_no, reason: e.to_string() }),
        }
    }
}

impl LogStore for JsonlLogStore {
    fn append(&mut self, row: &LogRow) -> Result<(), LogStoreError> {
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        self.index.insert(row);
        Ok(())
    }

    fn index(&self) -> &LogIndex {
        &self.index
    }

    fn read_rows(&self) -> Result<Vec<LogRow>, LogStoreError> {
        let mut rows = Vec::with_capacity(self.index.len());
        scan(&self.path, |row| rows.push(row))?;
        Ok(rows)
    }

    fn archive(&mut self, suffix: &str) -> Result<Option<PathBuf>, LogStoreError> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!("-{suffix}"));
        let target = PathBuf::from(name);
        self.file.sync_all()?;
        fs::rename(&self.path, &target)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.index = LogIndex::default();
        log::info!("log store: archived to {}", target.display());
        Ok(Some(target))
    }
}

// ─── Memory ──────────────────────────────────────────────────────────────────

/// Non-durable store, for tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct MemoryLogStore {
    rows: Vec<LogRow>,
    index: LogIndex,
    pub archived: Vec<(String, Vec<LogRow>)>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<LogRow>) -> Self {
        let mut store = Self::default();
        for row in rows {
            store.index.insert(&row);
            store.rows.push(row);
        }
        store
    }

    pub fn rows(&self) -> &[LogRow] {
        &self.rows
    }
}

impl LogStore for MemoryLogStore {
    fn append(&mut self, row: &LogRow) -> Result<(), LogStoreError> {
        self.index.insert(row);
        self.rows.push(row.clone());
        Ok(())
    }

    fn index(&self) -> &LogIndex {
        &self.index
    }

    fn read_rows(&self) -> Result<Vec<LogRow>, LogStoreError> {
        Ok(self.rows.clone())
    }

    fn archive(&mut self, suffix: &str) -> Result<Option<PathBuf>, LogStoreError> {
        self.archived.push((suffix.to_string(), std::mem::take(&mut self.rows)));
        self.index = LogIndex::default();
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn row(lap: u32, timer: u64, total: u64) -> LogRow {
        LogRow {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
                + chrono::TimeDelta::seconds(total as i64),
            lap,
            timer,
            total_timer_time: total,
            position_lat: None,
            position_long: None,
            gps_altitude: None,
            gps_distance: 0.0,
            gps_mode: None,
            gps_used_sats: None,
            gps_total_sats: None,
            gps_track: None,
            heart_rate: None,
            cadence: None,
            distance: 0.0,
            speed: None,
            power: None,
            accumulated_power: 0.0,
            temperature: None,
            pressure: None,
            altitude: None,
            heading: None,
            motion: None,
            acc_x: None,
            acc_y: None,
            acc_z: None,
            voltage_battery: None,
            voltage_in: None,
            current_in: None,
            voltage_out: None,
            current_out: None,
            capacity_in: None,
            capacity_out: None,
            battery_percentage: None,
            total_ascent: None,
            total_descent: None,
            lap_heart_rate: 0.0,
            lap_cadence: 0.0,
            lap_distance: 0.0,
            lap_speed: 0.0,
            lap_power: 0.0,
            lap_accumulated_power: 0.0,
            lap_total_ascent: 0.0,
            lap_total_descent: 0.0,
            avg_heart_rate: 0.0,
            avg_cadence: 0.0,
            avg_speed: 0.0,
            avg_power: 0.0,
            lap_cad_count: 0,
            lap_cad_sum: 0.0,
            avg_cad_count: 0,
            avg_cad_sum: 0.0,
            lap_power_count: 0,
            lap_power_sum: 0.0,
            avg_power_count: 0,
            avg_power_sum: 0.0,
        }
    }

    #[test]
    fn test_index_ignores_boundary_rows_for_maxima() {
        let mut index = LogIndex::default();
        let mut a = row(0, 1, 1);
        a.heart_rate = Some(150.0);
        a.distance = 100.0;
        index.insert(&a);
        let mut boundary = row(1, 0, 1);
        boundary.heart_rate = Some(150.0);
        boundary.distance = 100.0;
        index.insert(&boundary);

        assert_eq!(index.max_lap(), Some(1));
        assert_eq!(index.lap(0).unwrap().maxima[StatKey::HeartRate], 150.0);
        assert_eq!(index.lap(1).unwrap().maxima[StatKey::HeartRate], 0.0);
        assert_eq!(index.lap(1).unwrap().last_totals[StatKey::Distance], 0.0);
        assert_eq!(index.last_row(), Some(&boundary));
    }

    #[test]
    fn test_jsonl_roundtrip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut r = row(0, 1, 1);
        r.lap_heart_rate = 0.1 + 0.2;
        r.avg_power_sum = 1.0 / 3.0;
        {
            let mut store = JsonlLogStore::open(&path).unwrap();
            store.append(&r).unwrap();
        }
        let store = JsonlLogStore::open(&path).unwrap();
        assert_eq!(store.read_rows().unwrap(), vec![r.clone()]);
        assert_eq!(store.index().last_row(), Some(&r));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        {
            let mut store = JsonlLogStore::open(&path).unwrap();
            store.append(&row(0, 1, 1)).unwrap();
            store.append(&row(0, 2, 2)).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"timestamp\":\"2024-05-01T08:").unwrap();
        drop(f);

        let mut store = JsonlLogStore::open(&path).unwrap();
        assert_eq!(store.index().len(), 2);
        store.append(&row(0, 3, 3)).unwrap();
        assert_eq!(store.read_rows().unwrap().len(), 3);
    }

    #[test]
    fn test_bad_middle_line_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let good = serde_json::to_string(&row(0, 1, 1)).unwrap();
        fs::write(&path, format!("{good}\nnot a row\n{good}\n")).unwrap();
        assert!(matches!(JsonlLogStore::open(&path), Err(LogStoreError::Corrupt { line: 2, .. })));
    }

    #[test]
    fn test_archive_moves_file_and_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut store = JsonlLogStore::open(&path).unwrap();
        store.append(&row(0, 1, 1)).unwrap();
        let target = store.archive("2024-05-01_08-00-01").unwrap().unwrap();
        assert!(target.ends_with("log.jsonl-2024-05-01_08-00-01"));
        assert!(target.exists());
        assert!(store.index().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }
}
