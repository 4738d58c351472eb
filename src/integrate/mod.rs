// integrate: the fixed-interval fusion tick
//
// Reads the sensor store, resolves each quantity from its highest-priority
// fresh source, advances the derived metrics (grade, W′ balance, rolling
// averages) and drives autostop. Pure computation: no channels, no clock
// beyond the `Instant` passed in, so every scenario is replayable in tests.

pub mod averages;
pub mod grade;
pub mod pacing;
pub mod stopwatch;
pub mod w_prime;

use std::time::{Duration, Instant};

use crate::ant::{AntDeviceType, AntSlot, PowerPage};
use crate::config::{Settings, StalenessThresholds, WPrimeAlgorithm};
use crate::gps::GpsValues;
use crate::store::{DeviceValues, SensorStore};
use crate::types::{ImuValues, StopwatchStatus};

pub use averages::{RollingAverage, RollingAverages, AVERAGE_SECS};
pub use grade::{conv_grade, DistanceSource, GradeEstimate, GradeEstimator};
pub use pacing::{Pacer, PacingWarning};
pub use stopwatch::{autostop, AutostopInput, Stopwatch};
pub use w_prime::{WPrimeBalance, WPrimeState};

/// Power pages in resolution order; one meter never sends both 0x11 and 0x12.
const POWER_PRIORITY: [PowerPage; 3] =
    [PowerPage::CrankTorque, PowerPage::WheelTorque, PowerPage::Standard];
const CADENCE_PRIORITY: [PowerPage; 2] = [PowerPage::CrankTorque, PowerPage::Standard];

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct IntegrationConfig {
    pub interval: Duration,
    pub staleness: StalenessThresholds,
    pub cp: f64,
    pub w_prime: f64,
    pub algorithm: WPrimeAlgorithm,
    /// m/s
    pub autostop_cutoff: f64,
    pub grade_range: usize,
    pub grade_window_size: usize,
    pub dummy: bool,
}

impl From<&Settings> for IntegrationConfig {
    fn from(s: &Settings) -> Self {
        Self {
            interval: s.interval(),
            staleness: s.staleness.clone(),
            cp: s.power.cp,
            w_prime: s.power.w_prime,
            algorithm: s.power.algorithm,
            autostop_cutoff: s.autostop_cutoff,
            grade_range: s.grade_range,
            grade_window_size: s.grade_window_size,
            dummy: s.dummy_output,
        }
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum IntegrationEvent {
    StopwatchChanged(StopwatchStatus),
    /// The bound wheel sensor has produced no distance; GPS distance is used instead
    GpsDistanceFallback { gps_diff: f64 },
    SlowTick { elapsed: Duration },
    LoopOverrun { elapsed: Duration },
}

impl From<PacingWarning> for IntegrationEvent {
    fn from(w: PacingWarning) -> Self {
        match w {
            PacingWarning::SlowTick { elapsed } => IntegrationEvent::SlowTick { elapsed },
            PacingWarning::Overrun { elapsed } => IntegrationEvent::LoopOverrun { elapsed },
        }
    }
}

// ─── Output snapshot ─────────────────────────────────────────────────────────

/// One fused tick. Unknown quantities are `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntegratedSample {
    pub heart_rate: Option<f64>,
    /// m/s
    pub speed: Option<f64>,
    pub cadence: Option<f64>,
    pub power: Option<f64>,
    /// m, monotonic within a session
    pub distance: f64,
    /// J, monotonic within a session
    pub accumulated_power: f64,
    pub grade: Option<i32>,
    pub grade_spd: Option<i32>,
    pub glide_ratio: Option<i32>,
    pub temperature: Option<f64>,
    pub w_prime: WPrimeState,
    /// 3 s / 30 s / 60 s
    pub ave_heart_rate: [Option<f64>; 3],
    pub ave_power: [Option<f64>; 3],
    pub stopwatch: Stopwatch,
    pub gps: GpsValues,
    pub imu: ImuValues,
}

/// Per-source increments of one tick.
#[derive(Clone, Copy, Debug, Default)]
struct Diffs {
    ant: f64,
    gps: f64,
}

// ─── Integrator ──────────────────────────────────────────────────────────────

pub struct Integrator {
    config: IntegrationConfig,
    pacer: Pacer,
    grade: GradeEstimator,
    w_prime: WPrimeBalance,
    ave_heart_rate: RollingAverages,
    ave_power: RollingAverages,
    pre_dst: Diffs,
    pre_work: f64,
    pre_alt_ant: Option<f64>,
    pre_alt_gps: Option<f64>,
    pre_alt_spd: Option<f64>,
    distance: f64,
    accumulated_power: f64,
    /// Ascent/descent carried over from a resumed log.
    climb_offset: (f64, f64),
    fallback_active: bool,
}

impl Integrator {
    pub fn new(config: IntegrationConfig) -> Self {
        let interval = config.interval.as_secs_f64();
        Self {
            pacer: Pacer::new(config.interval),
            grade: GradeEstimator::new(config.grade_range, config.grade_window_size),
            w_prime: WPrimeBalance::new(config.cp, config.w_prime, config.algorithm, interval),
            ave_heart_rate: RollingAverages::new(interval),
            ave_power: RollingAverages::new(interval),
            pre_dst: Diffs::default(),
            pre_work: 0.0,
            pre_alt_ant: None,
            pre_alt_gps: None,
            pre_alt_spd: None,
            distance: 0.0,
            accumulated_power: 0.0,
            climb_offset: (0.0, 0.0),
            fallback_active: false,
            config,
        }
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    /// Sleep before the next tick.
    pub fn wait(&self) -> Duration {
        self.pacer.wait()
    }

    /// Record how long the tick body took and adjust pacing.
    pub fn finish_tick(&mut self, elapsed: Duration) -> Vec<IntegrationEvent> {
        let warnings = self.pacer.after_tick(elapsed);
        for w in &warnings {
            match w {
                PacingWarning::SlowTick { elapsed } => {
                    log::warn!("integrate: slow tick {:.3}s", elapsed.as_secs_f64())
                }
                PacingWarning::Overrun { elapsed } => {
                    log::warn!("integrate: tick took {:.3}s, pacing reset", elapsed.as_secs_f64())
                }
            }
        }
        warnings.into_iter().map(IntegrationEvent::from).collect()
    }

    /// Seed the session accumulators after resuming a log.
    pub fn restore(&mut self, distance: f64, accumulated_power: f64) {
        self.distance = distance;
        self.accumulated_power = accumulated_power;
    }

    /// Continue the barometric climb totals from a resumed log. The IMU
    /// producer restarts from zero, so its totals are offset by these.
    pub fn restore_climb(&mut self, total_ascent: Option<f64>, total_descent: Option<f64>) {
        self.climb_offset = (total_ascent.unwrap_or(0.0), total_descent.unwrap_or(0.0));
    }

    /// Clear everything for a new session.
    pub fn reset(&mut self) {
        let interval = self.config.interval.as_secs_f64();
        self.grade = GradeEstimator::new(self.config.grade_range, self.config.grade_window_size);
        self.w_prime.reset();
        self.ave_heart_rate = RollingAverages::new(interval);
        self.ave_power = RollingAverages::new(interval);
        self.pre_dst = Diffs::default();
        self.pre_work = 0.0;
        self.pre_alt_ant = None;
        self.pre_alt_gps = None;
        self.pre_alt_spd = None;
        self.distance = 0.0;
        self.accumulated_power = 0.0;
        self.climb_offset = (0.0, 0.0);
        self.fallback_active = false;
    }

    pub fn tick(
        &mut self,
        store: &SensorStore,
        stopwatch: &mut Stopwatch,
        now: Instant,
    ) -> (IntegratedSample, Vec<IntegrationEvent>) {
        let mut events = Vec::new();
        let th = &self.config.staleness;
        let speed_slot = store.slot(AntSlot::Speed);
        let speed_enabled = speed_slot.is_some();
        let power_enabled = store.bindings().is_enabled(AntSlot::Power);
        let hr_enabled = store.bindings().is_enabled(AntSlot::HeartRate);
        let gps = &store.gps;
        let imu = &store.imu;

        // ── Priority resolution ──
        let heart_rate = slot_values(store, AntSlot::HeartRate)
            .and_then(|(_, v)| v.heart_rate)
            .and_then(|s| s.fresh(now, th.heart_rate()));

        let cadence = slot_values(store, AntSlot::Cadence).and_then(|(device_type, v)| {
            match device_type {
                AntDeviceType::Power => CADENCE_PRIORITY
                    .iter()
                    .find_map(|p| v.power.get(p))
                    .filter(|rec| fresh_at(rec.at, now, th.cadence()))
                    .and_then(|rec| rec.cadence),
                _ => v.cadence.and_then(|s| s.fresh(now, th.cadence())),
            }
        });

        let power = slot_values(store, AntSlot::Power).and_then(|(_, v)| {
            POWER_PRIORITY
                .iter()
                .filter_map(|p| v.power.get(p))
                .find(|rec| fresh_at(rec.at, now, th.power()))
                .map(|rec| rec.power)
        });

        let (ant_speed, ant_speed_heard) = match slot_values(store, AntSlot::Speed) {
            Some((AntDeviceType::Power, v)) => {
                let rec = v.power.get(&PowerPage::WheelTorque);
                let speed = rec.filter(|r| fresh_at(r.at, now, th.speed())).and_then(|r| r.speed);
                (speed, rec.is_some())
            }
            Some((_, v)) => (v.speed.and_then(|s| s.fresh(now, th.speed())), v.speed.is_some()),
            None => (None, false),
        };

        let speed = if speed_enabled {
            match ant_speed {
                // dead wheel sensor while the accelerometer says we are rolling
                None if imu.moving == Some(true) && gps.speed.is_some_and(|s| s > 0.0) => gps.speed,
                s => s,
            }
        } else {
            gps.timestamp.filter(|&at| fresh_at(at, now, th.speed())).and(gps.speed)
        };

        let temperature = if store.bindings().is_enabled(AntSlot::Temperature) {
            slot_values(store, AntSlot::Temperature)
                .and_then(|(_, v)| v.temperature)
                .and_then(|s| s.fresh(now, th.temperature()))
        } else {
            imu.temperature
        };

        // ── Distance ──
        let mut dst = Diffs::default();
        if speed_enabled {
            let total = match slot_values(store, AntSlot::Speed) {
                Some((AntDeviceType::Power, v)) => {
                    v.power.get(&PowerPage::WheelTorque).map_or(0.0, |r| r.distance)
                }
                Some((_, v)) => v.distance,
                None => 0.0,
            };
            if self.pre_dst.ant < total {
                dst.ant = total - self.pre_dst.ant;
            }
            self.pre_dst.ant = total;
        }
        if gps.timestamp.is_some() {
            if self.pre_dst.gps < gps.distance {
                dst.gps = gps.distance - self.pre_dst.gps;
            }
            self.pre_dst.gps = gps.distance;
        }

        let mut source = DistanceSource::Ant;
        let mut dst_use = 0.0;
        if speed_enabled {
            dst_use = dst.ant;
            let ant_silent = self.pre_dst.ant == 0.0 && dst.ant == 0.0;
            if ant_silent && dst.gps > 0.0 && (!ant_speed_heard || imu.moving == Some(true)) {
                dst_use = dst.gps;
                source = DistanceSource::Gps;
                if !self.fallback_active {
                    log::warn!("integrate: wheel sensor reports no distance, using GPS");
                    events.push(IntegrationEvent::GpsDistanceFallback { gps_diff: dst.gps });
                }
                self.fallback_active = true;
            }
        } else if dst.gps > 0.0 {
            dst_use = dst.gps;
            source = DistanceSource::Gps;
        }

        // ── Accumulated power ──
        let mut work_diff = 0.0;
        if let Some((_, v)) = slot_values(store, AntSlot::Power) {
            if let Some(rec) = POWER_PRIORITY.iter().find_map(|p| v.power.get(p)) {
                if self.pre_work < rec.accumulated_power {
                    work_diff = rec.accumulated_power - self.pre_work;
                }
                self.pre_work = rec.accumulated_power;
            }
        }

        // ── Altitude increments ──
        let mut alt_ant = Some(0.0);
        let mut alt_gps = Some(0.0);
        let mut alt_spd = Some(0.0);
        if let Some(alt) = imu.altitude {
            if dst.ant > 0.0 {
                alt_ant = self.pre_alt_ant.map(|p| alt - p);
            }
            self.pre_alt_ant = Some(alt);
            if dst.gps > 0.0 {
                alt_gps = self.pre_alt_gps.map(|p| alt - p);
            }
            self.pre_alt_gps = Some(alt);
            if speed_enabled {
                if dst.ant > 0.0 {
                    alt_spd = self.pre_alt_spd.map(|p| alt - p);
                }
                self.pre_alt_spd = Some(alt);
            }
        }
        let alt_use = match source {
            DistanceSource::Ant => alt_ant,
            DistanceSource::Gps => alt_gps,
        };

        // ── Grade ──
        let running = stopwatch.status.is_running();
        let estimate = self.grade.update(dst_use, alt_use, source, running);
        let grade_spd = if speed_enabled {
            let loop_secs = self.pacer.actual_loop_interval().as_secs_f64();
            self.grade.update_speed(speed.unwrap_or(0.0) * loop_secs, alt_spd)
        } else {
            self.grade.hold_speed(running)
        };

        self.distance += dst_use;
        self.accumulated_power += work_diff;

        // ── W′ balance and averages ──
        if power_enabled {
            if let Some(p) = power {
                self.w_prime.update(p);
                self.ave_power.push(p);
            }
        }
        if hr_enabled {
            if let Some(hr) = heart_rate {
                self.ave_heart_rate.push(hr);
            }
        }

        // ── Autostop ──
        let input = AutostopInput {
            speed,
            moving: imu.moving,
            ant_speed_enabled: speed_enabled,
            gps_seen: gps.timestamp.is_some(),
            dummy: self.config.dummy,
        };
        if let Some(status) = autostop(stopwatch, input, self.config.autostop_cutoff) {
            events.push(IntegrationEvent::StopwatchChanged(status));
        }

        let sample = IntegratedSample {
            heart_rate,
            speed,
            cadence,
            power,
            distance: self.distance,
            accumulated_power: self.accumulated_power,
            grade: estimate.grade,
            grade_spd,
            glide_ratio: estimate.glide_ratio,
            temperature,
            w_prime: self.w_prime.state(),
            ave_heart_rate: self.ave_heart_rate.means(),
            ave_power: self.ave_power.means(),
            stopwatch: *stopwatch,
            gps: gps.clone(),
            imu: ImuValues {
                total_ascent: imu.total_ascent.map(|a| a + self.climb_offset.0),
                total_descent: imu.total_descent.map(|d| d + self.climb_offset.1),
                ..imu.clone()
            },
        };
        (sample, events)
    }
}

fn fresh_at(at: Instant, now: Instant, threshold: Duration) -> bool {
    crate::types::is_fresh(at, now, threshold)
}

/// Device type and values of the device enabled on `slot`, once it has sent anything.
fn slot_values(store: &SensorStore, slot: AntSlot) -> Option<(AntDeviceType, &DeviceValues)> {
    let (key, values) = store.slot(slot)?;
    values.map(|v| (key.device_type, v))
}
