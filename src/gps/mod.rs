//! GPS validation and fusion.
//!
//! Every raw fix is normalized into `GpsValues`. Fixes failing the quality
//! gates leave position, altitude and track at their last good values and
//! the speed unknown. Distance accrues only while the stopwatch runs.

pub mod clock;
pub mod dummy;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc};
use geo::{HaversineDistance, Point};
use std::time::Instant;

use crate::config::Settings;
use crate::types::{FixMode, GpsFix, ManualFix, PositionError, StopwatchStatus};
pub use clock::{ClockControl, NoClock, SystemClock};

const ALTITUDE_FLOOR: f64 = -500.0;
const HDOP_CUTOFF_MODERATE: f64 = 10.0;
const HDOP_CUTOFF_FAIR: f64 = 20.0;

#[derive(Clone, Debug)]
pub struct GpsConfig {
    pub dop_cutoff: [f64; 3],
    pub used_sat_cutoff: u32,
    pub epx_epy_cutoff: f64,
    pub epv_cutoff: f64,
    pub sp1_epv_cutoff: f64,
    pub sp1_used_sats_cutoff: u32,
    pub speed_cutoff: f64,
    pub min_valid_date: NaiveDate,
    pub manual_time_offset: TimeDelta,
}

impl From<&Settings> for GpsConfig {
    fn from(s: &Settings) -> Self {
        Self {
            dop_cutoff: s.gps.dop_cutoff,
            used_sat_cutoff: s.gps.used_sat_cutoff,
            epx_epy_cutoff: s.gps.epx_epy_cutoff,
            epv_cutoff: s.gps.epv_cutoff,
            sp1_epv_cutoff: s.gps.sp1_epv_cutoff,
            sp1_used_sats_cutoff: s.gps.sp1_used_sats_cutoff,
            speed_cutoff: s.gps_speed_cutoff(),
            min_valid_date: s.gps.min_valid_date,
            manual_time_offset: TimeDelta::milliseconds(s.gps.manual_time_offset_ms),
        }
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Fused GPS state as published to the sensor store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpsValues {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    /// m/s, exactly 0 at or below the speed cutoff
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub track_str: Option<&'static str>,
    pub mode: Option<FixMode>,
    pub used_sats: Option<u32>,
    pub total_sats: Option<u32>,
    pub dop: [Option<f64>; 3],
    pub error: Option<PositionError>,
    pub utc_time: Option<DateTime<Utc>>,
    /// m, since session start
    pub distance: f64,
    pub valid: bool,
    /// Time of the last processed fix
    pub timestamp: Option<Instant>,
}

#[derive(Clone, Copy, Debug, Default)]
struct PreValues {
    lat: Option<f64>,
    lon: Option<f64>,
    alt: Option<f64>,
    track: Option<f64>,
}

/// 8-point compass label for a heading.
pub fn track_str(track: f64) -> &'static str {
    const LABELS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];
    let idx = ((track.rem_euclid(360.0) + 22.5) / 45.0) as usize % 8;
    LABELS[idx]
}

/// Great-circle distance in metres.
pub fn distance_on_earth(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    Point::new(lon1, lat1).haversine_distance(&Point::new(lon2, lat2))
}

pub struct GpsFusion {
    config: GpsConfig,
    values: GpsValues,
    pre: PreValues,
    clock: Box<dyn ClockControl>,
    timezone_fixed: bool,
    time_modified: bool,
}

impl GpsFusion {
    pub fn new(config: GpsConfig, clock: Box<dyn ClockControl>) -> Self {
        Self {
            config,
            values: GpsValues::default(),
            pre: PreValues::default(),
            clock,
            timezone_fixed: false,
            time_modified: false,
        }
    }

    pub fn values(&self) -> &GpsValues {
        &self.values
    }

    /// Session reset: distance back to zero, position history kept.
    pub fn reset(&mut self) {
        self.values.distance = 0.0;
    }

    pub fn is_position_valid(&self, fix: &GpsFix) -> bool {
        let (Some(lat), Some(lon)) = (fix.lat, fix.lon) else { return false };
        if lat.abs() > 90.0 || lon.abs() > 180.0 {
            return false;
        }
        if fix.mode.map_or(true, |m| m < FixMode::Fix3d) {
            return false;
        }
        for (dop, cutoff) in fix.dop.iter().zip(self.config.dop_cutoff) {
            match dop {
                Some(d) if *d < cutoff => {}
                _ => return false,
            }
        }
        let Some(used) = fix.used_sats else { return false };
        if used <= self.config.used_sat_cutoff {
            return false;
        }
        if let Some(err) = fix.error {
            let (Some(epx), Some(epy), Some(epv)) = (err.epx, err.epy, err.epv) else {
                return false;
            };
            let c = &self.config;
            if epx >= c.epx_epy_cutoff || epy >= c.epx_epy_cutoff || epv >= c.epv_cutoff {
                return false;
            }
            if used < c.sp1_used_sats_cutoff && epv > c.sp1_epv_cutoff {
                return false;
            }
        }
        true
    }

    /// Fold one fix into the fused values.
    pub fn update(&mut self, fix: &GpsFix, stopwatch: StopwatchStatus, now: Instant) -> &GpsValues {
        if self.values.lat.is_some() && self.values.lon.is_some() {
            self.pre = PreValues {
                lat: self.values.lat,
                lon: self.values.lon,
                alt: self.values.alt,
                track: self.values.track,
            };
        }
        let distance = self.values.distance;
        self.values = GpsValues { distance, ..GpsValues::default() };

        let valid = self.is_position_valid(fix);
        self.values.valid = valid;
        if valid {
            self.values.lat = fix.lat;
            self.values.lon = fix.lon;
        } else {
            self.values.lat = self.pre.lat;
            self.values.lon = self.pre.lon;
        }

        self.values.alt = match fix.alt {
            Some(alt) if valid => Some(alt.max(ALTITUDE_FLOOR)),
            _ => self.pre.alt,
        };

        if stopwatch.is_running() {
            if let (Some(plat), Some(plon), Some(lat), Some(lon)) =
                (self.pre.lat, self.pre.lon, self.values.lat, self.values.lon)
            {
                self.values.distance += distance_on_earth(plat, plon, lat, lon);
            }
        }

        if let Some(speed) = fix.speed.filter(|_| valid) {
            self.values.speed = Some(if speed <= self.config.speed_cutoff { 0.0 } else { speed });
        }

        match (fix.track, fix.speed) {
            (Some(track), Some(speed)) if speed > self.config.speed_cutoff => {
                let track = track.trunc();
                self.values.track = Some(track);
                self.values.track_str = Some(track_str(track));
            }
            _ => self.values.track = self.pre.track,
        }

        if !self.timezone_fixed && valid && fix.mode == Some(FixMode::Fix3d) {
            if let (Some(lat), Some(lon)) = (fix.lat, fix.lon) {
                match self.clock.set_timezone(lat, lon) {
                    Ok(zone) => {
                        log::info!("[gps] timezone set to {}", zone);
                        self.timezone_fixed = true;
                    }
                    Err(e) => log::warn!("[gps] could not set timezone: {}", e),
                }
            }
        }

        self.values.timestamp = Some(now);
        self.values.mode = fix.mode;
        self.values.dop = fix.dop;
        self.values.used_sats = fix.used_sats;
        self.values.total_sats = fix.total_sats;
        self.values.error = fix.error;

        if let Some(t) = fix.utc_time {
            self.apply_utc_time(t);
        }
        &self.values
    }

    fn apply_utc_time(&mut self, t: DateTime<Utc>) {
        self.values.utc_time = Some(t);
        if t.year() < 2000 || self.time_modified {
            return;
        }
        let earliest = self.clock.earliest_valid_time().max(
            self.config.min_valid_date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc(),
        );
        if t < earliest {
            return;
        }
        match self.clock.set_time(t) {
            Ok(()) => {
                log::info!("[gps] system time set to {}", t);
                self.time_modified = true;
            }
            Err(e) => log::warn!("[gps] could not set time: {}", e),
        }
    }

    /// A paired phone pushed a location. Quality is derived from HDOP only.
    pub fn update_manual(
        &mut self,
        m: &ManualFix,
        stopwatch: StopwatchStatus,
        now: Instant,
    ) -> &GpsValues {
        let fix = manual_to_fix(m, self.config.manual_time_offset);
        self.update(&fix, stopwatch, now)
    }
}

/// Translate a paired-phone location into the canonical fix shape.
pub fn manual_to_fix(m: &ManualFix, offset: TimeDelta) -> GpsFix {
    let mode = if m.hdop < HDOP_CUTOFF_MODERATE {
        FixMode::Fix3d
    } else if m.hdop < HDOP_CUTOFF_FAIR {
        FixMode::Fix2d
    } else {
        FixMode::NoFix
    };
    GpsFix {
        lat: Some(m.lat),
        lon: Some(m.lon),
        alt: m.alt,
        speed: m.speed,
        track: m.track,
        mode: Some(mode),
        used_sats: Some(m.satellites),
        total_sats: None,
        dop: [Some(m.hdop); 3],
        error: None,
        utc_time: DateTime::from_timestamp(m.time_ms.div_euclid(1000), 0).map(|t| t - offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ClockLog {
        zones: Vec<(f64, f64)>,
        times: Vec<DateTime<Utc>>,
        fail_zone: bool,
    }

    struct FakeClock(Arc<Mutex<ClockLog>>);

    impl ClockControl for FakeClock {
        fn set_timezone(&mut self, lat: f64, lon: f64) -> Result<String, String> {
            let mut log = self.0.lock().unwrap();
            log.zones.push((lat, lon));
            if log.fail_zone { Err("no zone".into()) } else { Ok("Asia/Tokyo".into()) }
        }
        fn set_time(&mut self, utc: DateTime<Utc>) -> Result<(), String> {
            self.0.lock().unwrap().times.push(utc);
            Ok(())
        }
        fn earliest_valid_time(&self) -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap()
        }
    }

    fn fusion() -> (GpsFusion, Arc<Mutex<ClockLog>>) {
        let log = Arc::new(Mutex::new(ClockLog::default()));
        (GpsFusion::new(GpsConfig::default(), Box::new(FakeClock(log.clone()))), log)
    }

    fn good_fix(lat: f64, lon: f64, speed: f64) -> GpsFix {
        GpsFix {
            lat: Some(lat),
            lon: Some(lon),
            alt: Some(40.0),
            speed: Some(speed),
            track: Some(45.7),
            mode: Some(FixMode::Fix3d),
            used_sats: Some(8),
            total_sats: Some(12),
            dop: [Some(1.5), Some(0.9), Some(1.2)],
            error: None,
            utc_time: None,
        }
    }

    #[test]
    fn test_validity_gates() {
        let (f, _) = fusion();
        assert!(f.is_position_valid(&good_fix(35.0, 139.0, 5.0)));

        let mut fix = good_fix(35.0, 139.0, 5.0);
        fix.used_sats = Some(3);
        assert!(!f.is_position_valid(&fix));

        let mut fix = good_fix(35.0, 139.0, 5.0);
        fix.mode = Some(FixMode::Fix2d);
        assert!(!f.is_position_valid(&fix));

        let mut fix = good_fix(35.0, 139.0, 5.0);
        fix.dop[1] = None;
        assert!(!f.is_position_valid(&fix));

        let mut fix = good_fix(95.0, 139.0, 5.0);
        assert!(!f.is_position_valid(&fix));
        fix.lat = Some(35.0);
        fix.error = Some(PositionError { epx: Some(5.0), epy: Some(5.0), epv: Some(150.0) });
        assert!(!f.is_position_valid(&fix));
    }

    #[test]
    fn test_invalid_fix_holds_position_and_blanks_speed() {
        let (mut f, _) = fusion();
        let now = Instant::now();
        f.update(&good_fix(35.0, 139.0, 5.0), StopwatchStatus::Stop, now);

        let mut bad = good_fix(36.0, 140.0, 7.0);
        bad.mode = Some(FixMode::NoFix);
        let v = f.update(&bad, StopwatchStatus::Stop, now).clone();
        assert_eq!((v.lat, v.lon), (Some(35.0), Some(139.0)));
        assert_eq!(v.alt, Some(40.0));
        assert_eq!(v.speed, None);
        assert_eq!(v.track, Some(45.0));
        assert!(!v.valid);
    }

    #[test]
    fn test_distance_only_while_running() {
        let (mut f, _) = fusion();
        let now = Instant::now();
        f.update(&good_fix(35.0, 139.0, 5.0), StopwatchStatus::Start, now);
        f.update(&good_fix(35.001, 139.0, 5.0), StopwatchStatus::Stop, now);
        assert_eq!(f.values().distance, 0.0);
        f.update(&good_fix(35.002, 139.0, 5.0), StopwatchStatus::Start, now);
        assert_relative_eq!(f.values().distance, 111.19, epsilon = 0.1);
        f.reset();
        assert_eq!(f.values().distance, 0.0);
    }

    #[test]
    fn test_slow_speed_clamped_and_altitude_floored() {
        let (mut f, _) = fusion();
        let mut fix = good_fix(35.0, 139.0, 0.5);
        fix.alt = Some(-900.0);
        let v = f.update(&fix, StopwatchStatus::Stop, Instant::now());
        assert_eq!(v.speed, Some(0.0));
        assert_eq!(v.alt, Some(-500.0));
        assert_eq!(v.track, None);
    }

    #[test]
    fn test_timezone_set_once_on_success_only() {
        let (mut f, log) = fusion();
        log.lock().unwrap().fail_zone = true;
        let now = Instant::now();
        f.update(&good_fix(35.0, 139.0, 5.0), StopwatchStatus::Stop, now);
        log.lock().unwrap().fail_zone = false;
        f.update(&good_fix(35.0, 139.0, 5.0), StopwatchStatus::Stop, now);
        f.update(&good_fix(35.0, 139.0, 5.0), StopwatchStatus::Stop, now);
        assert_eq!(log.lock().unwrap().zones.len(), 2);
    }

    #[test]
    fn test_time_set_once_and_old_times_ignored() {
        let (mut f, log) = fusion();
        let now = Instant::now();
        let mut fix = good_fix(35.0, 139.0, 5.0);
        fix.utc_time = Some(Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0).unwrap());
        f.update(&fix, StopwatchStatus::Stop, now);
        fix.utc_time = Some(Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap());
        f.update(&fix, StopwatchStatus::Stop, now);
        assert!(log.lock().unwrap().times.is_empty());

        let good = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        fix.utc_time = Some(good);
        f.update(&fix, StopwatchStatus::Stop, now);
        fix.utc_time = Some(good + TimeDelta::seconds(1));
        f.update(&fix, StopwatchStatus::Stop, now);
        assert_eq!(log.lock().unwrap().times, vec![good]);
    }

    #[test]
    fn test_manual_fix_mode_from_hdop() {
        let m = |hdop| ManualFix {
            lat: 35.0,
            lon: 139.0,
            alt: None,
            speed: Some(3.0),
            track: None,
            hdop,
            satellites: 0,
            time_ms: 1_717_228_800_500,
        };
        assert_eq!(manual_to_fix(&m(5.0), TimeDelta::zero()).mode, Some(FixMode::Fix3d));
        assert_eq!(manual_to_fix(&m(15.0), TimeDelta::zero()).mode, Some(FixMode::Fix2d));
        let fix = manual_to_fix(&m(25.0), TimeDelta::hours(9));
        assert_eq!(fix.mode, Some(FixMode::NoFix));
        assert_eq!(fix.dop, [Some(25.0); 3]);
        assert_eq!(fix.utc_time, Some(Utc.with_ymd_and_hms(2024, 5, 31, 23, 0, 0).unwrap()));
    }

    #[test]
    fn test_track_labels() {
        assert_eq!(track_str(0.0), "N");
        assert_eq!(track_str(44.0), "NE");
        assert_eq!(track_str(181.0), "S");
        assert_eq!(track_str(350.0), "N");
    }
}
