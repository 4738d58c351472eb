use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// A value together with the instant it was produced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub at: Instant,
}

impl<T: Copy> Stamped<T> {
    pub fn new(value: T, at: Instant) -> Self {
        Self { value, at }
    }

    /// The value, if it is no older than `threshold` at `now`.
    pub fn fresh(&self, now: Instant, threshold: Duration) -> Option<T> {
        is_fresh(self.at, now, threshold).then_some(self.value)
    }
}

/// The single staleness rule used for every sensor reading.
pub fn is_fresh(at: Instant, now: Instant, threshold: Duration) -> bool {
    now.saturating_duration_since(at) < threshold
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopwatchStatus {
    /// Nothing recorded since boot or reset
    #[default]
    Init,
    Start,
    Stop,
}

impl StopwatchStatus {
    pub fn toggled(self) -> Self {
        match self {
            StopwatchStatus::Start => StopwatchStatus::Stop,
            StopwatchStatus::Init | StopwatchStatus::Stop => StopwatchStatus::Start,
        }
    }

    pub fn is_running(self) -> bool {
        self == StopwatchStatus::Start
    }
}

/// GPS fix quality as reported by the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FixMode {
    NoFix = 1,
    Fix2d = 2,
    Fix3d = 3,
}

/// Estimated position errors, metres.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionError {
    pub epx: Option<f64>,
    pub epy: Option<f64>,
    pub epv: Option<f64>,
}

/// One raw fix in canonical form, whatever receiver produced it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpsFix {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    /// m/s
    pub speed: Option<f64>,
    /// degrees, 0 = north
    pub track: Option<f64>,
    pub mode: Option<FixMode>,
    pub used_sats: Option<u32>,
    pub total_sats: Option<u32>,
    /// PDOP, HDOP, VDOP
    pub dop: [Option<f64>; 3],
    /// Only receivers reporting error estimates fill this in.
    pub error: Option<PositionError>,
    pub utc_time: Option<DateTime<Utc>>,
}

/// A location pushed from a paired phone. Carries HDOP only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManualFix {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub hdop: f64,
    pub satellites: u32,
    /// Epoch milliseconds
    pub time_ms: i64,
}

/// Values from the onboard I2C sensors, decoded elsewhere.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuValues {
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    /// Accelerometer motion flag. `None` when no accelerometer is fitted.
    pub moving: Option<bool>,
    /// Motion level behind `moving`
    pub motion: Option<f64>,
    /// m/s², x/y/z
    pub acc: [Option<f64>; 3],
    pub total_ascent: Option<f64>,
    pub total_descent: Option<f64>,
    pub power: PowerSupplyValues,
}

/// Battery and charger readings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerSupplyValues {
    pub voltage_battery: Option<f64>,
    pub voltage_in: Option<f64>,
    pub current_in: Option<f64>,
    pub voltage_out: Option<f64>,
    pub current_out: Option<f64>,
    pub capacity_in: Option<f64>,
    pub capacity_out: Option<f64>,
    pub battery_percentage: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_boundary() {
        let t0 = Instant::now();
        let s = Stamped::new(120.0, t0);
        assert_eq!(s.fresh(t0 + Duration::from_millis(2999), Duration::from_secs(3)), Some(120.0));
        assert_eq!(s.fresh(t0 + Duration::from_secs(3), Duration::from_secs(3)), None);
    }

    #[test]
    fn test_stopwatch_toggle() {
        assert_eq!(StopwatchStatus::Stop.toggled(), StopwatchStatus::Start);
        assert!(StopwatchStatus::Start.is_running());
        assert_eq!(StopwatchStatus::Init.toggled(), StopwatchStatus::Start);
        assert!(!StopwatchStatus::default().is_running());
    }
}
