//! Lap / pre-lap / whole-ride statistics.
//!
//! Heart rate and speed are averaged incrementally over ticks. Cadence and
//! power keep an explicit (sum, count) per scope so zero samples can be left
//! out. Distance, work and climb are monotonic: their lap value is the
//! distance from the reading frozen at the last lap boundary.

use std::ops::{Index, IndexMut};

use crate::config::AverageIncludingZero;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatKey {
    HeartRate,
    Cadence,
    Distance,
    Speed,
    Power,
    AccumulatedPower,
    TotalAscent,
    TotalDescent,
}

impl StatKey {
    pub const ALL: [StatKey; 8] = [
        StatKey::HeartRate,
        StatKey::Cadence,
        StatKey::Distance,
        StatKey::Speed,
        StatKey::Power,
        StatKey::AccumulatedPower,
        StatKey::TotalAscent,
        StatKey::TotalDescent,
    ];

    /// Keys whose maxima are tracked by comparison.
    pub const AVERAGED: [StatKey; 4] =
        [StatKey::HeartRate, StatKey::Cadence, StatKey::Speed, StatKey::Power];

    /// Running totals, never averaged.
    pub const MONOTONIC: [StatKey; 4] =
        [StatKey::Distance, StatKey::AccumulatedPower, StatKey::TotalAscent, StatKey::TotalDescent];

    fn idx(self) -> usize {
        self as usize
    }
}

/// One value per `StatKey`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LapValues([f64; 8]);

impl Index<StatKey> for LapValues {
    type Output = f64;
    fn index(&self, key: StatKey) -> &f64 {
        &self.0[key.idx()]
    }
}

impl IndexMut<StatKey> for LapValues {
    fn index_mut(&mut self, key: StatKey) -> &mut f64 {
        &mut self.0[key.idx()]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RecordStats {
    pub pre_lap_avg: LapValues,
    pub lap_avg: LapValues,
    pub entire_avg: LapValues,
    pub pre_lap_max: LapValues,
    pub lap_max: LapValues,
    pub entire_max: LapValues,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SumCount {
    pub sum: f64,
    pub count: u64,
}

impl SumCount {
    fn push(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Zero-aware cadence/power accumulators for the lap and the whole ride.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Accumulators {
    pub lap_cadence: SumCount,
    pub lap_power: SumCount,
    pub entire_cadence: SumCount,
    pub entire_power: SumCount,
}

/// The eight tracked readings of one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickValues {
    pub heart_rate: Option<f64>,
    pub cadence: Option<f64>,
    pub distance: Option<f64>,
    pub speed: Option<f64>,
    pub power: Option<f64>,
    pub accumulated_power: Option<f64>,
    pub total_ascent: Option<f64>,
    pub total_descent: Option<f64>,
}

impl TickValues {
    fn get(&self, key: StatKey) -> Option<f64> {
        match key {
            StatKey::HeartRate => self.heart_rate,
            StatKey::Cadence => self.cadence,
            StatKey::Distance => self.distance,
            StatKey::Speed => self.speed,
            StatKey::Power => self.power,
            StatKey::AccumulatedPower => self.accumulated_power,
            StatKey::TotalAscent => self.total_ascent,
            StatKey::TotalDescent => self.total_descent,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LapStats {
    pub stats: RecordStats,
    pub acc: Accumulators,
}

/// Mean of `n` values given the mean of the first `n - 1` and the newest.
fn running_mean(prev: f64, x: f64, n: u64) -> f64 {
    (prev * (n - 1) as f64 + x) / n as f64
}

impl LapStats {
    /// Fold one counted tick in. `count_lap` and `count` already include it.
    pub fn update(
        &mut self,
        v: &TickValues,
        count_lap: u64,
        count: u64,
        include_zero: AverageIncludingZero,
    ) {
        let s = &mut self.stats;
        for key in StatKey::ALL {
            let Some(x) = v.get(key) else { continue };
            match key {
                StatKey::HeartRate | StatKey::Speed => {
                    if count_lap > 0 {
                        s.lap_avg[key] = running_mean(s.lap_avg[key], x, count_lap);
                    }
                    if count > 0 {
                        s.entire_avg[key] = running_mean(s.entire_avg[key], x, count);
                    }
                }
                StatKey::Cadence | StatKey::Power => {
                    let (include, lap, entire) = if key == StatKey::Cadence {
                        let acc = &mut self.acc;
                        (include_zero.cadence, &mut acc.lap_cadence, &mut acc.entire_cadence)
                    } else {
                        let acc = &mut self.acc;
                        (include_zero.power, &mut acc.lap_power, &mut acc.entire_power)
                    };
                    if x != 0.0 || include {
                        lap.push(x);
                        entire.push(x);
                        if let (Some(l), Some(e)) = (lap.mean(), entire.mean()) {
                            s.lap_avg[key] = l;
                            s.entire_avg[key] = e;
                        }
                    }
                }
                _ => {
                    s.lap_avg[key] = x - s.pre_lap_max[key];
                    s.lap_max[key] = x;
                    s.entire_max[key] = x;
                }
            }
            if StatKey::AVERAGED.contains(&key) {
                s.lap_max[key] = s.lap_max[key].max(x);
                s.entire_max[key] = s.entire_max[key].max(x);
            }
        }
    }

    /// Freeze the current lap and start a new one.
    pub fn roll_lap(&mut self) {
        let s = &mut self.stats;
        s.pre_lap_avg = s.lap_avg;
        s.pre_lap_max = s.lap_max;
        s.lap_avg = LapValues::default();
        s.lap_max = LapValues::default();
        self.acc.lap_cadence = SumCount::default();
        self.acc.lap_power = SumCount::default();
    }
}
