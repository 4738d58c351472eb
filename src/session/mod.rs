//! Session logger: one durable row per counted tick, lap bookkeeping and
//! crash resume.
//!
//! Running statistics live in memory and are written into every row, so the
//! whole state can be rebuilt from the last row plus the store's per-lap
//! index. Lap-boundary rows carry `timer == 0` and never feed statistics.

pub mod row;
pub mod stats;
pub mod store;
pub mod track;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Instant;

use crate::config::{AverageIncludingZero, Settings};
use crate::error::{SessionError, SessionResult};
use crate::export::Exporter;
use crate::integrate::IntegratedSample;
use crate::types::StopwatchStatus;

pub use row::LogRow;
pub use stats::{Accumulators, LapStats, LapValues, RecordStats, StatKey, SumCount, TickValues};
pub use store::{JsonlLogStore, LogIndex, LogStore, MemoryLogStore};
pub use track::simplify_track;

/// Archive suffix and export file stem.
pub const SESSION_DATE_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub path: PathBuf,
    pub export_dir: PathBuf,
    pub include_zero: AverageIncludingZero,
    pub display_interval_distance: f64,
}

impl From<&Settings> for LoggerConfig {
    fn from(s: &Settings) -> Self {
        Self {
            path: s.log.path.clone(),
            export_dir: s.log.export_dir.clone(),
            include_zero: s.average_including_zero,
            display_interval_distance: s.log.display_interval_distance,
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// State rebuilt from an existing log.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeState {
    pub lap: u32,
    pub count_lap: u64,
    pub count: u64,
    pub distance: f64,
    pub accumulated_power: f64,
    pub total_ascent: Option<f64>,
    pub total_descent: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResumeOutcome {
    Fresh,
    Resumed(ResumeState),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResetOutcome {
    Rejected(&'static str),
    /// Where the previous log went, if the store moved it anywhere
    Reset { archive: Option<PathBuf> },
}

pub struct SessionLogger {
    config: LoggerConfig,
    store: Box<dyn LogStore>,
    lap: u32,
    count_lap: u64,
    count: u64,
    stats: LapStats,
    last_sample: IntegratedSample,
}

impl SessionLogger {
    /// Open the logger over `store`, resuming whatever it already holds.
    pub fn open(
        config: LoggerConfig,
        store: Box<dyn LogStore>,
    ) -> SessionResult<(Self, ResumeOutcome)> {
        let mut logger = Self {
            config,
            store,
            lap: 0,
            count_lap: 0,
            count: 0,
            stats: LapStats::default(),
            last_sample: IntegratedSample::default(),
        };
        let outcome = logger.resume()?;
        Ok((logger, outcome))
    }

    /// Open the JSON-lines log named in `config`. A corrupt log is a resume failure.
    pub fn open_jsonl(config: LoggerConfig) -> SessionResult<(Self, ResumeOutcome)> {
        let store = JsonlLogStore::open(&config.path).map_err(|e| match e {
            e @ crate::error::LogStoreError::Corrupt { .. } => SessionError::Resume(e.to_string()),
            e => SessionError::Store(e),
        })?;
        Self::open(config, Box::new(store))
    }

    pub fn lap(&self) -> u32 {
        self.lap
    }

    pub fn count_lap(&self) -> u64 {
        self.count_lap
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn stats(&self) -> &LapStats {
        &self.stats
    }

    pub fn store(&self) -> &dyn LogStore {
        self.store.as_ref()
    }

    /// Per-tick entry point. Counts and records only while the stopwatch runs.
    /// Returns whether a row was written.
    pub fn on_tick(&mut self, sample: &IntegratedSample, at: DateTime<Utc>) -> SessionResult<bool> {
        self.last_sample = sample.clone();
        if !sample.stopwatch.status.is_running() {
            return Ok(false);
        }
        self.count += 1;
        self.count_lap += 1;
        self.record_log(at)?;
        Ok(true)
    }

    /// Fold the last sample into the statistics and append its row.
    fn record_log(&mut self, at: DateTime<Utc>) -> SessionResult<()> {
        // The lap boundary row repeats the last tick; it is written but not
        // folded into the averages a second time.
        if self.count_lap > 0 {
            let v = tick_values(&self.last_sample);
            self.stats.update(&v, self.count_lap, self.count, self.config.include_zero);
        }
        let row = self.build_row(at);
        let started = Instant::now();
        self.store.append(&row)?;
        if self.count % 1800 == 10 {
            log::debug!(
                "session: insert at tick {} took {:.3}s",
                self.count,
                started.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    /// Close the current lap. No-op until the lap has counted a tick.
    pub fn count_laps(&mut self, at: DateTime<Utc>) -> SessionResult<bool> {
        if self.count == 0 || self.count_lap == 0 {
            return Ok(false);
        }
        self.lap += 1;
        self.count_lap = 0;
        self.stats.roll_lap();
        log::info!("session: lap {} at tick {}", self.lap, self.count);
        self.record_log(at)?;
        Ok(true)
    }

    /// Export the session, archive the log and start over.
    ///
    /// Refused while the ride is manually running or before anything was
    /// recorded. An export failure aborts with the live log untouched.
    pub fn reset_count(
        &mut self,
        manual: StopwatchStatus,
        exporters: &[Box<dyn Exporter>],
    ) -> SessionResult<ResetOutcome> {
        if manual.is_running() {
            return Ok(ResetOutcome::Rejected("stopwatch is running"));
        }
        if self.count == 0 {
            return Ok(ResetOutcome::Rejected("nothing recorded"));
        }
        let session = self.session_name();
        if !exporters.is_empty() {
            let rows = self.store.read_rows()?;
            for exporter in exporters {
                let started = Instant::now();
                let path = exporter.export(&rows, &self.config.export_dir, &session)?;
                log::info!(
                    "session: wrote {} {} in {:.3}s",
                    exporter.name(),
                    path.display(),
                    started.elapsed().as_secs_f64()
                );
            }
        }
        let archive = self.store.archive(&session)?;
        self.init_value();
        log::info!("session: reset, previous log archived as {session}");
        Ok(ResetOutcome::Reset { archive })
    }

    /// Session start as used in archive and export names.
    pub fn session_name(&self) -> String {
        self.store
            .index()
            .first_timestamp()
            .unwrap_or_else(Utc::now)
            .format(SESSION_DATE_FORMAT)
            .to_string()
    }

    fn init_value(&mut self) {
        self.lap = 0;
        self.count_lap = 0;
        self.count = 0;
        self.stats = LapStats::default();
    }

    /// Simplified track of positioned rows newer than `since`, plus the
    /// newest row timestamp to pass next time.
    pub fn update_track(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> SessionResult<(Option<DateTime<Utc>>, Vec<(f64, f64)>)> {
        let rows: Vec<LogRow> = self
            .store
            .read_rows()?
            .into_iter()
            .filter(|r| since.map_or(true, |t| r.timestamp > t))
            .collect();
        let newest = rows.iter().map(|r| r.timestamp).max().or(since);
        Ok((newest, simplify_track(&rows, self.config.display_interval_distance)))
    }

    fn resume(&mut self) -> SessionResult<ResumeOutcome> {
        let index = self.store.index();
        let Some(last) = index.last_row().cloned() else {
            return Ok(ResumeOutcome::Fresh);
        };
        let Some(current) = index.lap(last.lap) else {
            return Err(SessionError::Resume(format!("no index entry for lap {}", last.lap)));
        };

        let mut stats = LapStats::default();
        let s = &mut stats.stats;
        s.lap_avg = lap_columns(&last);
        s.entire_avg[StatKey::HeartRate] = last.avg_heart_rate;
        s.entire_avg[StatKey::Cadence] = last.avg_cadence;
        s.entire_avg[StatKey::Speed] = last.avg_speed;
        s.entire_avg[StatKey::Power] = last.avg_power;
        stats.acc = Accumulators {
            lap_cadence: SumCount { sum: last.lap_cad_sum, count: last.lap_cad_count },
            lap_power: SumCount { sum: last.lap_power_sum, count: last.lap_power_count },
            entire_cadence: SumCount { sum: last.avg_cad_sum, count: last.avg_cad_count },
            entire_power: SumCount { sum: last.avg_power_sum, count: last.avg_power_count },
        };

        let entire_max = index.entire_max();
        let entire_totals = index.entire_totals();
        for key in StatKey::AVERAGED {
            s.lap_max[key] = current.maxima[key];
            s.entire_max[key] = entire_max[key];
        }
        for key in StatKey::MONOTONIC {
            s.lap_max[key] = current.last_totals[key];
            s.entire_max[key] = entire_totals[key];
        }

        if last.lap >= 1 {
            let Some(prev) = index.lap(last.lap - 1) else {
                return Err(SessionError::Resume(format!(
                    "lap {} missing before lap {}",
                    last.lap - 1,
                    last.lap
                )));
            };
            s.pre_lap_avg = lap_columns(&prev.last_row);
            for key in StatKey::AVERAGED {
                s.pre_lap_max[key] = prev.maxima[key];
            }
            for key in StatKey::MONOTONIC {
                s.pre_lap_max[key] = prev.last_totals[key];
            }
        }

        self.lap = last.lap;
        self.count_lap = last.timer;
        self.count = last.total_timer_time;
        self.stats = stats;
        log::info!(
            "session: resumed {} rows, lap {} tick {} of {}, {:.0} m",
            index.len(),
            self.lap,
            self.count_lap,
            self.count,
            last.distance
        );
        Ok(ResumeOutcome::Resumed(ResumeState {
            lap: self.lap,
            count_lap: self.count_lap,
            count: self.count,
            distance: last.distance,
            accumulated_power: last.accumulated_power,
            total_ascent: last.total_ascent,
            total_descent: last.total_descent,
        }))
    }

    fn build_row(&self, at: DateTime<Utc>) -> LogRow {
        let sm = &self.last_sample;
        let g = &sm.gps;
        let imu = &sm.imu;
        let st = &self.stats.stats;
        let acc = &self.stats.acc;
        LogRow {
            timestamp: at,
            lap: self.lap,
            timer: self.count_lap,
            total_timer_time: self.count,
            position_lat: g.lat,
            position_long: g.lon,
            gps_altitude: g.alt,
            gps_distance: g.distance,
            gps_mode: g.mode.map(|m| m as u8),
            gps_used_sats: g.used_sats,
            gps_total_sats: g.total_sats,
            gps_track: g.track,
            heart_rate: sm.heart_rate,
            cadence: sm.cadence,
            distance: sm.distance,
            speed: sm.speed,
            power: sm.power,
            accumulated_power: sm.accumulated_power,
            temperature: sm.temperature,
            pressure: imu.pressure,
            altitude: imu.altitude,
            heading: imu.heading,
            motion: imu.motion,
            acc_x: imu.acc[0],
            acc_y: imu.acc[1],
            acc_z: imu.acc[2],
            voltage_battery: imu.power.voltage_battery,
            voltage_in: imu.power.voltage_in,
            current_in: imu.power.current_in,
            voltage_out: imu.power.voltage_out,
            current_out: imu.power.current_out,
            capacity_in: imu.power.capacity_in,
            capacity_out: imu.power.capacity_out,
            battery_percentage: imu.power.battery_percentage,
            total_ascent: imu.total_ascent,
            total_descent: imu.total_descent,
            lap_heart_rate: st.lap_avg[StatKey::HeartRate],
            lap_cadence: st.lap_avg[StatKey::Cadence],
            lap_distance: st.lap_avg[StatKey::Distance],
            lap_speed: st.lap_avg[StatKey::Speed],
            lap_power: st.lap_avg[StatKey::Power],
            lap_accumulated_power: st.lap_avg[StatKey::AccumulatedPower],
            lap_total_ascent: st.lap_avg[StatKey::TotalAscent],
            lap_total_descent: st.lap_avg[StatKey::TotalDescent],
            avg_heart_rate: st.entire_avg[StatKey::HeartRate],
            avg_cadence: st.entire_avg[StatKey::Cadence],
            avg_speed: st.entire_avg[StatKey::Speed],
            avg_power: st.entire_avg[StatKey::Power],
            lap_cad_count: acc.lap_cadence.count,
            lap_cad_sum: acc.lap_cadence.sum,
            avg_cad_count: acc.entire_cadence.count,
            avg_cad_sum: acc.entire_cadence.sum,
            lap_power_count: acc.lap_power.count,
            lap_power_sum: acc.lap_power.sum,
            avg_power_count: acc.entire_power.count,
            avg_power_sum: acc.entire_power.sum,
        }
    }
}

fn tick_values(s: &IntegratedSample) -> TickValues {
    TickValues {
        heart_rate: s.heart_rate,
        cadence: s.cadence,
        distance: Some(s.distance),
        speed: s.speed,
        power: s.power,
        accumulated_power: Some(s.accumulated_power),
        total_ascent: s.imu.total_ascent,
        total_descent: s.imu.total_descent,
    }
}

fn lap_columns(row: &LogRow) -> LapValues {
    let mut v = LapValues::default();
    v[StatKey::HeartRate] = row.lap_heart_rate;
    v[StatKey::Cadence] = row.lap_cadence;
    v[StatKey::Distance] = row.lap_distance;
    v[StatKey::Speed] = row.lap_speed;
    v[StatKey::Power] = row.lap_power;
    v[StatKey::AccumulatedPower] = row.lap_accumulated_power;
    v[StatKey::TotalAscent] = row.lap_total_ascent;
    v[StatKey::TotalDescent] = row.lap_total_descent;
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;
    use crate::integrate::Stopwatch;
    use chrono::{TimeDelta, TimeZone};
    use std::path::Path;

    fn t(i: u64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + TimeDelta::seconds(i as i64)
    }

    fn running() -> Stopwatch {
        let mut sw = Stopwatch::default();
        sw.toggle_manual();
        sw
    }

    fn sample(i: u64) -> IntegratedSample {
        IntegratedSample {
            heart_rate: Some(120.0 + (i % 7) as f64),
            cadence: Some(if i % 5 == 0 { 0.0 } else { 80.0 + (i % 3) as f64 }),
            speed: Some(7.0 + (i % 4) as f64 * 0.3),
            power: Some(150.0 + (i % 11) as f64 * 7.0),
            distance: i as f64 * 7.3,
            accumulated_power: i as f64 * 171.0,
            stopwatch: running(),
            ..Default::default()
        }
    }

    struct FailingExporter;

    impl Exporter for FailingExporter {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn export(&self, _: &[LogRow], _: &Path, _: &str) -> Result<PathBuf, ExportError> {
            Err(ExportError::Format { format: "failing", reason: "disk full".into() })
        }
    }

    fn reopen(rows: Vec<LogRow>) -> (SessionLogger, ResumeOutcome) {
        let store = Box::new(MemoryLogStore::with_rows(rows));
        SessionLogger::open(LoggerConfig::default(), store).unwrap()
    }

    fn logger() -> SessionLogger {
        let (l, outcome) = reopen(Vec::new());
        assert_eq!(outcome, ResumeOutcome::Fresh);
        l
    }

    #[test]
    fn test_stopped_ticks_are_not_recorded() {
        let mut l = logger();
        let mut s = sample(1);
        s.stopwatch = Stopwatch::default();
        assert!(!l.on_tick(&s, t(1)).unwrap());
        assert_eq!(l.count(), 0);
        assert!(l.on_tick(&sample(2), t(2)).unwrap());
        assert_eq!((l.count(), l.count_lap()), (1, 1));
    }

    #[test]
    fn test_count_laps_freezes_and_writes_boundary_row() {
        let mut l = logger();
        assert!(!l.count_laps(t(0)).unwrap());
        for i in 1..=5 {
            l.on_tick(&sample(i), t(i)).unwrap();
        }
        let before = l.stats().stats;
        let power_samples = l.stats().acc.entire_power.count;
        assert!(l.count_laps(t(6)).unwrap());
        let st = l.stats().stats;
        // the boundary row is not counted a second time
        assert_eq!(l.stats().acc.entire_power.count, power_samples);
        assert_eq!(st.pre_lap_avg, before.lap_avg);
        assert_eq!(st.pre_lap_max, before.lap_max);
        assert_eq!(st.lap_avg, LapValues::default());
        assert_eq!(st.lap_max, LapValues::default());
        assert_eq!(st.entire_avg, before.entire_avg);

        let last = l.store().index().last_row().unwrap().clone();
        assert_eq!((last.lap, last.timer, last.total_timer_time), (1, 0, 5));
        // an empty lap cannot be closed
        assert!(!l.count_laps(t(7)).unwrap());
    }

    fn drive(l: &mut SessionLogger, ticks: std::ops::RangeInclusive<u64>) {
        for i in ticks {
            l.on_tick(&sample(i), t(i)).unwrap();
            if i % 9 == 0 {
                l.count_laps(t(i)).unwrap();
            }
        }
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let mut straight = logger();
        drive(&mut straight, 1..=40);

        let k = 23;
        let mut crashed = logger();
        drive(&mut crashed, 1..=k);
        let rows = crashed.store().read_rows().unwrap();
        let (mut resumed, outcome) = reopen(rows);
        let ResumeOutcome::Resumed(state) = outcome else { panic!("expected resume") };
        assert_eq!(state.count, k);
        assert_eq!(state.lap, 2);
        assert_eq!(state.distance, k as f64 * 7.3);
        assert_eq!(resumed.stats(), crashed.stats());

        drive(&mut resumed, k + 1..=40);
        assert_eq!(resumed.lap(), straight.lap());
        assert_eq!(resumed.count_lap(), straight.count_lap());
        assert_eq!(resumed.count(), straight.count());
        assert_eq!(resumed.stats(), straight.stats());
    }

    #[test]
    fn test_resume_right_after_lap_boundary() {
        let mut l = logger();
        for i in 1..=10 {
            l.on_tick(&sample(i), t(i)).unwrap();
        }
        l.count_laps(t(10)).unwrap();
        let rows = l.store().read_rows().unwrap();
        let (resumed, _) = reopen(rows);
        assert_eq!((resumed.lap(), resumed.count_lap(), resumed.count()), (1, 0, 10));
        assert_eq!(resumed.stats(), l.stats());
    }

    #[test]
    fn test_reset_guards_and_export_failure() {
        let mut l = logger();
        let none: Vec<Box<dyn Exporter>> = Vec::new();
        let outcome = l.reset_count(StopwatchStatus::Stop, &none).unwrap();
        assert_eq!(outcome, ResetOutcome::Rejected("nothing recorded"));
        l.on_tick(&sample(1), t(1)).unwrap();
        let outcome = l.reset_count(StopwatchStatus::Start, &none).unwrap();
        assert_eq!(outcome, ResetOutcome::Rejected("stopwatch is running"));

        let failing: Vec<Box<dyn Exporter>> = vec![Box::new(FailingExporter)];
        let outcome = l.reset_count(StopwatchStatus::Stop, &failing);
        assert!(matches!(outcome, Err(SessionError::Export(_))));
        assert_eq!(l.count(), 1);
        assert_eq!(l.store().index().len(), 1);

        let outcome = l.reset_count(StopwatchStatus::Stop, &none).unwrap();
        assert_eq!(outcome, ResetOutcome::Reset { archive: None });
        assert_eq!(l.count(), 0);
        assert!(l.store().index().is_empty());
    }

    #[test]
    fn test_session_name_is_first_row_time() {
        let mut l = logger();
        l.on_tick(&sample(1), t(1)).unwrap();
        l.on_tick(&sample(2), t(2)).unwrap();
        assert_eq!(l.session_name(), "2024-05-01_08-00-01");
    }

    #[test]
    fn test_update_track_is_incremental() {
        let mut l = logger();
        for i in 1..=5u64 {
            let mut s = sample(i);
            s.gps.lat = Some(35.0 + i as f64 * 1e-4);
            s.gps.lon = Some(139.0);
            l.on_tick(&s, t(i)).unwrap();
        }
        let (newest, track) = l.update_track(None).unwrap();
        assert_eq!(newest, Some(t(5)));
        assert!(!track.is_empty());
        let (newest, track) = l.update_track(newest).unwrap();
        assert_eq!(newest, Some(t(5)));
        assert!(track.is_empty());
    }
}
