use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One durable log record. Field order is the column order of every export.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    pub timestamp: DateTime<Utc>,
    pub lap: u32,
    /// Ticks in the current lap
    pub timer: u64,
    /// Ticks in the session
    pub total_timer_time: u64,

    pub position_lat: Option<f64>,
    pub position_long: Option<f64>,
    pub gps_altitude: Option<f64>,
    pub gps_distance: f64,
    pub gps_mode: Option<u8>,
    pub gps_used_sats: Option<u32>,
    pub gps_total_sats: Option<u32>,
    pub gps_track: Option<f64>,

    pub heart_rate: Option<f64>,
    pub cadence: Option<f64>,
    pub distance: f64,
    pub speed: Option<f64>,
    pub power: Option<f64>,
    pub accumulated_power: f64,

    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub motion: Option<f64>,
    pub acc_x: Option<f64>,
    pub acc_y: Option<f64>,
    pub acc_z: Option<f64>,
    pub voltage_battery: Option<f64>,
    pub voltage_in: Option<f64>,
    pub current_in: Option<f64>,
    pub voltage_out: Option<f64>,
    pub current_out: Option<f64>,
    pub capacity_in: Option<f64>,
    pub capacity_out: Option<f64>,
    pub battery_percentage: Option<f64>,
    pub total_ascent: Option<f64>,
    pub total_descent: Option<f64>,

    pub lap_heart_rate: f64,
    pub lap_cadence: f64,
    pub lap_distance: f64,
    pub lap_speed: f64,
    pub lap_power: f64,
    pub lap_accumulated_power: f64,
    pub lap_total_ascent: f64,
    pub lap_total_descent: f64,

    pub avg_heart_rate: f64,
    pub avg_cadence: f64,
    pub avg_speed: f64,
    pub avg_power: f64,

    pub lap_cad_count: u64,
    pub lap_cad_sum: f64,
    pub avg_cad_count: u64,
    pub avg_cad_sum: f64,
    pub lap_power_count: u64,
    pub lap_power_sum: f64,
    pub avg_power_count: u64,
    pub avg_power_sum: f64,
}

impl LogRow {
    /// A row counted by the stopwatch, as opposed to a lap-boundary marker.
    pub fn is_tick(&self) -> bool {
        self.timer > 0
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        self.position_lat.zip(self.position_long)
    }
}
