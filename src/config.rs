//! Runtime settings.
//!
//! One JSON document holds everything the head unit remembers between boots:
//! loop cadence, staleness thresholds, W′ model constants, GPS quality
//! cutoffs, log/export locations and the ANT+ slot bindings. Components never
//! see `Settings` itself; each takes the narrow config it needs
//! (`IntegrationConfig`, `GpsConfig`, `LoggerConfig`, `AntConfig`).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ant::AntSettings;
use crate::error::ConfigError;

/// 4 km/h expressed in m/s.
pub const DEFAULT_AUTOSTOP_CUTOFF: f64 = 4.0 * 1000.0 / 3600.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WPrimeAlgorithm {
    Waterworth,
    Differential,
}

/// Maximum reading age per sensor kind, in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessThresholds {
    pub heart_rate: f64,
    pub speed: f64,
    pub cadence: f64,
    pub power: f64,
    pub temperature: f64,
}

impl Default for StalenessThresholds {
    fn default() -> Self {
        Self { heart_rate: 15.0, speed: 5.0, cadence: 3.0, power: 3.0, temperature: 45.0 }
    }
}

impl StalenessThresholds {
    pub fn heart_rate(&self) -> Duration {
        Duration::from_secs_f64(self.heart_rate)
    }
    pub fn speed(&self) -> Duration {
        Duration::from_secs_f64(self.speed)
    }
    pub fn cadence(&self) -> Duration {
        Duration::from_secs_f64(self.cadence)
    }
    pub fn power(&self) -> Duration {
        Duration::from_secs_f64(self.power)
    }
    pub fn temperature(&self) -> Duration {
        Duration::from_secs_f64(self.temperature)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSettings {
    /// Critical power, W
    pub cp: f64,
    /// Anaerobic work capacity, J
    pub w_prime: f64,
    pub algorithm: WPrimeAlgorithm,
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self { cp: 150.0, w_prime: 15000.0, algorithm: WPrimeAlgorithm::Waterworth }
    }
}

/// Whether zero samples take part in the lap/session averages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AverageIncludingZero {
    pub cadence: bool,
    pub power: bool,
}

impl Default for AverageIncludingZero {
    fn default() -> Self {
        Self { cadence: false, power: true }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsSettings {
    /// PDOP, HDOP, VDOP upper bounds
    pub dop_cutoff: [f64; 3],
    /// A fix needs strictly more used satellites than this
    pub used_sat_cutoff: u32,
    pub epx_epy_cutoff: f64,
    pub epv_cutoff: f64,
    pub sp1_epv_cutoff: f64,
    pub sp1_used_sats_cutoff: u32,
    /// Speeds at or below this are reported as 0. `None` follows the autostop cutoff.
    pub speed_cutoff: Option<f64>,
    /// GPS times before this date never touch the system clock.
    pub min_valid_date: NaiveDate,
    /// Offset subtracted from paired-phone fix timestamps, ms
    pub manual_time_offset_ms: i64,
}

impl Default for GpsSettings {
    fn default() -> Self {
        Self {
            dop_cutoff: [99.0, 99.0, 99.0],
            used_sat_cutoff: 3,
            epx_epy_cutoff: 100.0,
            epv_cutoff: 100.0,
            sp1_epv_cutoff: 100.0,
            sp1_used_sats_cutoff: 3,
            speed_cutoff: None,
            min_valid_date: NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or_default(),
            manual_time_offset_ms: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub path: PathBuf,
    pub export_dir: PathBuf,
    pub write_csv: bool,
    pub write_gpx: bool,
    /// Minimum spacing of simplified track points, m
    pub display_interval_distance: f64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("log/log.jsonl"),
            export_dir: PathBuf::from("log"),
            write_csv: true,
            write_gpx: true,
            display_interval_distance: 5.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Integration tick, seconds
    pub sensor_interval: f64,
    pub staleness: StalenessThresholds,
    pub power: PowerSettings,
    pub average_including_zero: AverageIncludingZero,
    /// m/s
    pub autostop_cutoff: f64,
    /// m
    pub wheel_circumference: f64,
    pub grade_range: usize,
    pub grade_window_size: usize,
    pub gps: GpsSettings,
    pub log: LogSettings,
    pub ant: AntSettings,
    pub dummy_output: bool,
    pub dummy_seed: u64,
    /// Origin of the synthetic GPS track (lat, lon)
    pub dummy_position: (f64, f64),
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sensor_interval: 1.0,
            staleness: StalenessThresholds::default(),
            power: PowerSettings::default(),
            average_including_zero: AverageIncludingZero::default(),
            autostop_cutoff: DEFAULT_AUTOSTOP_CUTOFF,
            wheel_circumference: 2.105,
            grade_range: 9,
            grade_window_size: 5,
            gps: GpsSettings::default(),
            log: LogSettings::default(),
            ant: AntSettings::default(),
            dummy_output: false,
            dummy_seed: 0x5EED,
            dummy_position: (35.6818, 139.7647),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("settings file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io { path: path.to_path_buf(), source }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|source| ConfigError::Io { path: dir.to_path_buf(), source })?;
        }
        fs::write(path, json).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.sensor_interval)
    }

    pub fn gps_speed_cutoff(&self) -> f64 {
        self.gps.speed_cutoff.unwrap_or(self.autostop_cutoff)
    }
}

/// Destination for ANT+ slot bindings whenever a connect/disconnect changes them.
pub trait BindingStore: Send {
    fn save(&mut self, ant: &AntSettings) -> Result<(), ConfigError>;
}

/// Writes bindings back into the settings file they were loaded from.
pub struct SettingsFile {
    path: PathBuf,
    settings: Settings,
}

impl SettingsFile {
    pub fn new(path: PathBuf, settings: Settings) -> Self {
        Self { path, settings }
    }
}

impl BindingStore for SettingsFile {
    fn save(&mut self, ant: &AntSettings) -> Result<(), ConfigError> {
        self.settings.ant = ant.clone();
        self.settings.save(&self.path)
    }
}

/// Keeps bindings in memory only.
#[derive(Default)]
pub struct MemoryBindings {
    pub saved: Vec<AntSettings>,
}

impl BindingStore for MemoryBindings {
    fn save(&mut self, ant: &AntSettings) -> Result<(), ConfigError> {
        self.saved.push(ant.clone());
        Ok(())
    }
}
