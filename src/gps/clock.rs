use chrono::{DateTime, NaiveDate, Utc};
use std::process::Command;
use std::sync::OnceLock;
use tzf_rs::DefaultFinder;

/// System clock side effects triggered by the first good GPS fixes.
pub trait ClockControl: Send {
    /// Set the local timezone for a position. Returns the zone name applied.
    fn set_timezone(&mut self, lat: f64, lon: f64) -> Result<String, String>;
    /// Set the system clock (UTC).
    fn set_time(&mut self, utc: DateTime<Utc>) -> Result<(), String>;
    /// GPS times before this are treated as receiver garbage.
    fn earliest_valid_time(&self) -> DateTime<Utc>;
}

/// Uses `timedatectl` / `date` through sudo, as on the head unit image.
pub struct SystemClock {
    earliest: DateTime<Utc>,
}

impl SystemClock {
    pub fn new(fallback: NaiveDate) -> Self {
        let date = Command::new("uname")
            .arg("-v")
            .output()
            .ok()
            .and_then(|out| parse_kernel_build_date(&String::from_utf8_lossy(&out.stdout)))
            .unwrap_or(fallback);
        Self { earliest: midnight_utc(date) }
    }
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

/// `#1253 Thu Aug 15 11:37:30 BST 2019` → 2019-08-15
pub fn parse_kernel_build_date(version: &str) -> Option<NaiveDate> {
    let tokens: Vec<&str> = version.split_whitespace().collect();
    let year = tokens.last().filter(|t| t.len() == 4)?;
    tokens.windows(2).find_map(|w| {
        NaiveDate::parse_from_str(&format!("{} {} {}", year, w[0], w[1]), "%Y %b %d").ok()
    })
}

/// IANA zone for a position, from the polygon set bundled with `tzf-rs`.
/// The finder is built on first use. Open ocean resolves to an `Etc/GMT` zone.
pub fn zone_for_position(lat: f64, lon: f64) -> String {
    static FINDER: OnceLock<DefaultFinder> = OnceLock::new();
    let zone = FINDER.get_or_init(DefaultFinder::new).get_tz_name(lon, lat);
    if zone.is_empty() {
        zone_for_longitude(lon)
    } else {
        zone.to_string()
    }
}

/// Whole-hour nautical zone, for points outside every polygon.
fn zone_for_longitude(lon: f64) -> String {
    let offset = (lon / 15.0).round() as i32;
    match offset {
        0 => "Etc/UTC".to_string(),
        // POSIX Etc zones have inverted signs
        o if o > 0 => format!("Etc/GMT-{}", o),
        o => format!("Etc/GMT+{}", -o),
    }
}

fn run(cmd: &str, args: &[&str]) -> Result<(), String> {
    let status = Command::new(cmd).args(args).status().map_err(|e| format!("{}: {}", cmd, e))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("{} exited with {}", cmd, status))
    }
}

impl ClockControl for SystemClock {
    fn set_timezone(&mut self, lat: f64, lon: f64) -> Result<String, String> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(format!("position out of range: {}, {}", lat, lon));
        }
        let zone = zone_for_position(lat, lon);
        run("sudo", &["timedatectl", "set-timezone", &zone])?;
        Ok(zone)
    }

    fn set_time(&mut self, utc: DateTime<Utc>) -> Result<(), String> {
        let stamp = utc.format("%Y/%m/%d %H:%M:%S").to_string();
        run("sudo", &["date", "-u", "--set", &stamp])
    }

    fn earliest_valid_time(&self) -> DateTime<Utc> {
        self.earliest
    }
}

/// Leaves the system clock alone; used off-device and in dummy mode.
pub struct NoClock {
    earliest: DateTime<Utc>,
}

impl NoClock {
    pub fn new(earliest: NaiveDate) -> Self {
        Self { earliest: midnight_utc(earliest) }
    }
}

impl ClockControl for NoClock {
    fn set_timezone(&mut self, lat: f64, lon: f64) -> Result<String, String> {
        Ok(zone_for_position(lat, lon))
    }

    fn set_time(&mut self, _utc: DateTime<Utc>) -> Result<(), String> {
        Ok(())
    }

    fn earliest_valid_time(&self) -> DateTime<Utc> {
        self.earliest
    }
}
