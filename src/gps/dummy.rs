use chrono::Utc;

use crate::types::{FixMode, GpsFix};

const METERS_PER_DEG_LAT: f64 = 111_195.0;

/// Synthetic receiver riding north-east from an origin at a wavering pace.
pub struct DummyGps {
    lat: f64,
    lon: f64,
    seq: u64,
    interval: f64,
}

impl DummyGps {
    pub fn new(origin: (f64, f64), interval_secs: f64) -> Self {
        Self { lat: origin.0, lon: origin.1, seq: 0, interval: interval_secs }
    }

    pub fn next_fix(&mut self) -> GpsFix {
        let t = self.seq as f64;
        self.seq += 1;
        let speed = 6.0 + (t * 0.1).sin() * 2.0;
        let step = speed * self.interval / METERS_PER_DEG_LAT / std::f64::consts::SQRT_2;
        self.lat += step;
        self.lon += step / self.lat.to_radians().cos();

        GpsFix {
            lat: Some(self.lat),
            lon: Some(self.lon),
            alt: Some(40.0 + (t * 0.05).sin() * 10.0),
            speed: Some(speed),
            track: Some(45.0),
            mode: Some(FixMode::Fix3d),
            used_sats: Some(9),
            total_sats: Some(14),
            dop: [Some(1.6), Some(0.9), Some(1.3)],
            error: None,
            utc_time: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::{GpsConfig, GpsFusion, NoClock};
    use crate::types::StopwatchStatus;
    use chrono::NaiveDate;
    use std::time::Instant;

    #[test]
    fn test_dummy_fixes_pass_validation_and_move() {
        let mut gps = DummyGps::new((35.6818, 139.7647), 1.0);
        let clock = NoClock::new(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap());
        let mut fusion = GpsFusion::new(GpsConfig::default(), Box::new(clock));
        let now = Instant::now();
        for _ in 0..10 {
            let fix = gps.next_fix();
            assert!(fusion.is_position_valid(&fix));
            fusion.update(&fix, StopwatchStatus::Start, now);
        }
        // nine legs at 4-8 m/s
        let d = fusion.values().distance;
        assert!(d > 36.0 && d < 72.0, "distance {d}");
    }
}
