//! Per-device-type ANT+ data page decoders.
//!
//! Each decoder keeps just enough history to turn cumulative counters
//! (revolutions, event times, accumulated torque) into rates. The first page
//! of a counter pair only primes the decoder. All 16-bit counters roll over,
//! so deltas use wrapping arithmetic.

use std::f64::consts::PI;
use std::time::Instant;
use thiserror::Error;

use super::device::AntDeviceType;

/// Repeated identical events before a rate is reported as zero (~3 s at 4 Hz).
const STOP_AFTER_REPEATS: u32 = 12;
const INVALID_CADENCE: u8 = 0xFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PowerPage {
    /// 0x10, power only
    Standard,
    /// 0x11, wheel torque
    WheelTorque,
    /// 0x12, crank torque
    CrankTorque,
}

impl PowerPage {
    pub fn number(self) -> u8 {
        match self {
            PowerPage::Standard => 0x10,
            PowerPage::WheelTorque => 0x11,
            PowerPage::CrankTorque => 0x12,
        }
    }
}

/// Decoded fields of one data page.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AntPage {
    HeartRate { heart_rate: f64 },
    /// m/s and metres travelled since the previous page
    Speed { speed: f64, distance_delta: f64 },
    /// rpm
    Cadence { cadence: f64 },
    Power {
        page: PowerPage,
        power: f64,
        cadence: Option<f64>,
        speed: Option<f64>,
        distance_delta: f64,
        /// J done since the previous page
        work_delta: f64,
    },
    Temperature { celsius: f64 },
    Light { mode: u8 },
    Control { command: u16 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported page 0x{0:02X}")]
    UnsupportedPage(u8),
}

fn u16_at(data: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([data[i], data[i + 1]])
}

/// Event time (1/1024 s) plus revolution count, as sent by speed and cadence sensors.
#[derive(Clone, Copy, Debug, Default)]
struct RevCounter {
    last: Option<(u16, u16)>,
    repeats: u32,
}

impl RevCounter {
    /// Returns (revolutions, seconds) since the previous event, `Some((0, 0))`
    /// once the sensor has repeated itself long enough to count as stopped.
    fn update(&mut self, event_time: u16, revs: u16) -> Option<(f64, f64)> {
        let prev = self.last.replace((event_time, revs));
        let (prev_time, prev_revs) = prev?;
        let dt = event_time.wrapping_sub(prev_time);
        let dr = revs.wrapping_sub(prev_revs);
        if dt == 0 {
            self.repeats += 1;
            return (self.repeats >= STOP_AFTER_REPEATS).then_some((0.0, 0.0));
        }
        self.repeats = 0;
        Some((dr as f64, dt as f64 / 1024.0))
    }
}

/// Shared shape of torque pages 0x11/0x12.
#[derive(Clone, Copy, Debug, Default)]
struct TorqueCounter {
    last: Option<TorqueSample>,
    repeats: u32,
}

#[derive(Clone, Copy, Debug)]
struct TorqueSample {
    events: u8,
    ticks: u8,
    period: u16,
    torque: u16,
}

struct TorqueDelta {
    events: f64,
    ticks: f64,
    /// seconds
    period: f64,
    power: f64,
    work: f64,
}

impl TorqueCounter {
    fn update(&mut self, s: TorqueSample) -> Option<TorqueDelta> {
        let prev = self.last.replace(s)?;
        let events = s.events.wrapping_sub(prev.events);
        if events == 0 {
            self.repeats += 1;
            return (self.repeats >= STOP_AFTER_REPEATS).then_some(TorqueDelta {
                events: 0.0,
                ticks: 0.0,
                period: 0.0,
                power: 0.0,
                work: 0.0,
            });
        }
        self.repeats = 0;
        let period = s.period.wrapping_sub(prev.period) as f64;
        let torque = s.torque.wrapping_sub(prev.torque) as f64;
        let power = if period > 0.0 { 128.0 * PI * torque / period } else { 0.0 };
        Some(TorqueDelta {
            events: events as f64,
            ticks: s.ticks.wrapping_sub(prev.ticks) as f64,
            period: period / 2048.0,
            power,
            work: 2.0 * PI * torque / 32.0,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct StandardPowerCounter {
    last: Option<(u8, u16, Instant)>,
}

#[derive(Clone, Debug)]
pub struct PowerDecoder {
    circumference: f64,
    standard: StandardPowerCounter,
    wheel: TorqueCounter,
    crank: TorqueCounter,
}

impl PowerDecoder {
    fn decode(&mut self, data: &[u8], now: Instant) -> Result<Vec<AntPage>, DecodeError> {
        let cadence_byte = |b: u8| (b != INVALID_CADENCE).then_some(b as f64);
        match data[0] {
            0x10 => {
                let events = data[1];
                let accumulated = u16_at(data, 4);
                let power = u16_at(data, 6) as f64;
                let mut work_delta = 0.0;
                if let Some((prev_events, prev_acc, prev_at)) = self.standard.last {
                    let de = events.wrapping_sub(prev_events);
                    if de > 0 {
                        let avg = accumulated.wrapping_sub(prev_acc) as f64 / de as f64;
                        work_delta = avg * now.saturating_duration_since(prev_at).as_secs_f64();
                    }
                }
                if self.standard.last.map_or(true, |(e, _, _)| e != events) {
                    self.standard.last = Some((events, accumulated, now));
                }
                Ok(vec![AntPage::Power {
                    page: PowerPage::Standard,
                    power,
                    cadence: cadence_byte(data[3]),
                    speed: None,
                    distance_delta: 0.0,
                    work_delta,
                }])
            }
            page @ (0x11 | 0x12) => {
                let sample = TorqueSample {
                    events: data[1],
                    ticks: data[2],
                    period: u16_at(data, 4),
                    torque: u16_at(data, 6),
                };
                let counter = if page == 0x11 { &mut self.wheel } else { &mut self.crank };
                let Some(d) = counter.update(sample) else {
                    return Ok(Vec::new());
                };
                let rate = if d.period > 0.0 { d.events / d.period } else { 0.0 };
                let out = if page == 0x11 {
                    AntPage::Power {
                        page: PowerPage::WheelTorque,
                        power: d.power,
                        cadence: cadence_byte(data[3]),
                        speed: Some(self.circumference * rate),
                        distance_delta: self.circumference * d.ticks,
                        work_delta: d.work,
                    }
                } else {
                    AntPage::Power {
                        page: PowerPage::CrankTorque,
                        power: d.power,
                        cadence: Some(60.0 * rate),
                        speed: None,
                        distance_delta: 0.0,
                        work_delta: d.work,
                    }
                };
                Ok(vec![out])
            }
            // calibration, torque effectiveness, manufacturer pages
            0x01 | 0x02 | 0x13 | 0x50 | 0x51 | 0x52 => Ok(Vec::new()),
            other => Err(DecodeError::UnsupportedPage(other)),
        }
    }
}

/// Stateful decoder bound to one physical device.
#[derive(Clone, Debug)]
pub enum Decoder {
    HeartRate,
    SpeedAndCadence { circumference: f64, crank: RevCounterState, wheel: RevCounterState },
    Speed { circumference: f64, wheel: RevCounterState },
    Cadence { crank: RevCounterState },
    Power(PowerDecoder),
    Temperature,
    Light,
    Control,
}

/// Opaque decoder history.
#[derive(Clone, Copy, Debug, Default)]
pub struct RevCounterState(RevCounter);

impl Decoder {
    pub fn for_type(device_type: AntDeviceType, circumference: f64) -> Self {
        match device_type {
            AntDeviceType::HeartRate => Decoder::HeartRate,
            AntDeviceType::SpeedAndCadence => Decoder::SpeedAndCadence {
                circumference,
                crank: RevCounterState::default(),
                wheel: RevCounterState::default(),
            },
            AntDeviceType::Speed => {
                Decoder::Speed { circumference, wheel: RevCounterState::default() }
            }
            AntDeviceType::Cadence => Decoder::Cadence { crank: RevCounterState::default() },
            AntDeviceType::Power => Decoder::Power(PowerDecoder {
                circumference,
                standard: StandardPowerCounter::default(),
                wheel: TorqueCounter::default(),
                crank: TorqueCounter::default(),
            }),
            AntDeviceType::Temperature => Decoder::Temperature,
            AntDeviceType::Light => Decoder::Light,
            AntDeviceType::Control => Decoder::Control,
        }
    }

    /// Forget counter history so the next page primes again.
    pub fn reset(&mut self) {
        match self {
            Decoder::SpeedAndCadence { crank, wheel, .. } => {
                *crank = RevCounterState::default();
                *wheel = RevCounterState::default();
            }
            Decoder::Speed { wheel, .. } => *wheel = RevCounterState::default(),
            Decoder::Cadence { crank } => *crank = RevCounterState::default(),
            Decoder::Power(p) => {
                p.standard = StandardPowerCounter::default();
                p.wheel = TorqueCounter::default();
                p.crank = TorqueCounter::default();
            }
            Decoder::HeartRate | Decoder::Temperature | Decoder::Light | Decoder::Control => {}
        }
    }

    pub fn decode(&mut self, data: &[u8], now: Instant) -> Result<Vec<AntPage>, DecodeError> {
        if data.len() < 8 {
            return Err(DecodeError::TooShort(data.len()));
        }
        let data = &data[..8];
        match self {
            Decoder::HeartRate => Ok(vec![AntPage::HeartRate { heart_rate: data[7] as f64 }]),
            Decoder::SpeedAndCadence { circumference, crank, wheel } => {
                let mut out = Vec::with_capacity(2);
                if let Some((revs, secs)) = crank.0.update(u16_at(data, 0), u16_at(data, 2)) {
                    let cadence = if secs > 0.0 { 60.0 * revs / secs } else { 0.0 };
                    out.push(AntPage::Cadence { cadence });
                }
                if let Some((revs, secs)) = wheel.0.update(u16_at(data, 4), u16_at(data, 6)) {
                    out.push(speed_page(*circumference, revs, secs));
                }
                Ok(out)
            }
            Decoder::Speed { circumference, wheel } => Ok(wheel
                .0
                .update(u16_at(data, 4), u16_at(data, 6))
                .map(|(revs, secs)| speed_page(*circumference, revs, secs))
                .into_iter()
                .collect()),
            Decoder::Cadence { crank } => Ok(crank
                .0
                .update(u16_at(data, 4), u16_at(data, 6))
                .map(|(revs, secs)| AntPage::Cadence {
                    cadence: if secs > 0.0 { 60.0 * revs / secs } else { 0.0 },
                })
                .into_iter()
                .collect()),
            Decoder::Power(p) => p.decode(data, now),
            Decoder::Temperature => match data[0] {
                0x01 => {
                    let raw = i16::from_le_bytes([data[6], data[7]]);
                    Ok(vec![AntPage::Temperature { celsius: raw as f64 * 0.01 }])
                }
                0x00 | 0x50 | 0x51 | 0x52 => Ok(Vec::new()),
                other => Err(DecodeError::UnsupportedPage(other)),
            },
            Decoder::Light => match data[0] {
                0x01 => Ok(vec![AntPage::Light { mode: data[6] }]),
                0x02 | 0x50 | 0x51 | 0x52 => Ok(Vec::new()),
                other => Err(DecodeError::UnsupportedPage(other)),
            },
            Decoder::Control => match data[0] {
                0x49 => Ok(vec![AntPage::Control { command: u16_at(data, 6) }]),
                0x50 | 0x51 | 0x52 => Ok(Vec::new()),
                other => Err(DecodeError::UnsupportedPage(other)),
            },
        }
    }
}

fn speed_page(circumference: f64, revs: f64, secs: f64) -> AntPage {
    let speed = if secs > 0.0 { circumference * revs / secs } else { 0.0 };
    AntPage::Speed { speed, distance_delta: circumference * revs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn rev_frame(event_time: u16, revs: u16) -> [u8; 8] {
        let t = event_time.to_le_bytes();
        let r = revs.to_le_bytes();
        [0x00, 0, 0, 0, t[0], t[1], r[0], r[1]]
    }

    #[test]
    fn test_heart_rate_byte_seven() {
        let mut d = Decoder::for_type(AntDeviceType::HeartRate, 2.105);
        let pages = d.decode(&[0x04, 0, 0, 0, 0, 0, 0, 142], Instant::now()).unwrap();
        assert_eq!(pages, vec![AntPage::HeartRate { heart_rate: 142.0 }]);
    }

    #[test]
    fn test_speed_first_page_primes_then_rolls_over() {
        let now = Instant::now();
        let mut d = Decoder::for_type(AntDeviceType::Speed, 2.0);
        assert!(d.decode(&rev_frame(65_000, 65_535), now).unwrap().is_empty());

        // 1024 ticks later (1 s) across the rollover, 2 revolutions
        let pages = d.decode(&rev_frame(65_000u16.wrapping_add(1024), 1), now).unwrap();
        match pages[0] {
            AntPage::Speed { speed, distance_delta } => {
                assert_relative_eq!(speed, 4.0);
                assert_relative_eq!(distance_delta, 4.0);
            }
            other => panic!("unexpected page {other:?}"),
        }
    }

    #[test]
    fn test_repeated_events_report_stop() {
        let now = Instant::now();
        let mut d = Decoder::for_type(AntDeviceType::Cadence, 2.105);
        d.decode(&rev_frame(100, 10), now).unwrap();
        for _ in 0..STOP_AFTER_REPEATS - 1 {
            assert!(d.decode(&rev_frame(100, 10), now).unwrap().is_empty());
        }
        assert_eq!(
            d.decode(&rev_frame(100, 10), now).unwrap(),
            vec![AntPage::Cadence { cadence: 0.0 }]
        );
    }

    #[test]
    fn test_crank_torque_power_and_cadence() {
        let now = Instant::now();
        let mut d = Decoder::for_type(AntDeviceType::Power, 2.105);
        let frame = |ev: u8, period: u16, torque: u16| {
            let p = period.to_le_bytes();
            let t = torque.to_le_bytes();
            [0x12, ev, ev, 90, p[0], p[1], t[0], t[1]]
        };
        assert!(d.decode(&frame(1, 0, 0), now).unwrap().is_empty());
        // one revolution in 2048/2048 s with 20 Nm average torque
        let pages = d.decode(&frame(2, 2048, 640), now).unwrap();
        match pages[0] {
            AntPage::Power { page, power, cadence, work_delta, .. } => {
                assert_eq!(page, PowerPage::CrankTorque);
                assert_relative_eq!(power, 2.0 * PI * 20.0, epsilon = 1e-9);
                assert_relative_eq!(cadence.unwrap(), 60.0);
                assert_relative_eq!(work_delta, power, epsilon = 1e-9);
            }
            other => panic!("unexpected page {other:?}"),
        }
    }

    #[test]
    fn test_standard_power_page_work_uses_elapsed_time() {
        let t0 = Instant::now();
        let mut d = Decoder::for_type(AntDeviceType::Power, 2.105);
        let frame = |ev: u8, acc: u16, inst: u16| {
            let a = acc.to_le_bytes();
            let i = inst.to_le_bytes();
            [0x10, ev, 0xFF, 0xFF, a[0], a[1], i[0], i[1]]
        };
        d.decode(&frame(1, 200, 200), t0).unwrap();
        let pages = d.decode(&frame(3, 600, 200), t0 + Duration::from_secs(2)).unwrap();
        match pages[0] {
            AntPage::Power { power, cadence, work_delta, .. } => {
                assert_eq!(power, 200.0);
                assert_eq!(cadence, None);
                assert_relative_eq!(work_delta, 400.0);
            }
            other => panic!("unexpected page {other:?}"),
        }
    }

    #[test]
    fn test_temperature_signed_hundredths() {
        let mut d = Decoder::for_type(AntDeviceType::Temperature, 2.105);
        let raw = (-250i16).to_le_bytes();
        let pages = d.decode(&[0x01, 0, 0, 0, 0, 0, raw[0], raw[1]], Instant::now()).unwrap();
        assert_eq!(pages, vec![AntPage::Temperature { celsius: -2.5 }]);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        let mut d = Decoder::for_type(AntDeviceType::Power, 2.105);
        assert_eq!(d.decode(&[0x10, 1, 2], Instant::now()), Err(DecodeError::TooShort(3)));
        assert_eq!(
            d.decode(&[0x7E, 0, 0, 0, 0, 0, 0, 0], Instant::now()),
            Err(DecodeError::UnsupportedPage(0x7E))
        );
    }
}
