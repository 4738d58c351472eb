use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use super::decoder::{AntPage, PowerPage};
use super::device::{AntSettings, AntSlot, DeviceKey};
use crate::types::StopwatchStatus;

/// Synthetic ANT+ readings for bench use and for units without a node.
pub struct DummyAnt {
    rng: StdRng,
    interval: f64,
}

impl DummyAnt {
    pub fn new(seed: u64, interval: Duration) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), interval: interval.as_secs_f64() }
    }

    /// One tick worth of pages for the devices bound in `bindings`.
    /// Distance and work only accumulate while the ride is running.
    pub fn generate(
        &mut self,
        bindings: &AntSettings,
        manual: StopwatchStatus,
    ) -> Vec<(DeviceKey, AntPage)> {
        let heart_rate = self.rng.gen_range(70..=150) as f64;
        let speed = self.rng.gen_range(5..=30) as f64 / 3.6;
        let cadence = self.rng.gen_range(60..=100) as f64;
        let power = self.rng.gen_range(0..=250) as f64;
        let dt = if manual.is_running() { self.interval } else { 0.0 };

        let mut out = Vec::with_capacity(4);
        if let Some(key) = bindings.enabled_device(AntSlot::HeartRate) {
            out.push((key, AntPage::HeartRate { heart_rate }));
        }
        if let Some(key) = bindings.enabled_device(AntSlot::Speed) {
            out.push((key, AntPage::Speed { speed, distance_delta: speed * dt }));
        }
        if let Some(key) = bindings.enabled_device(AntSlot::Cadence) {
            out.push((key, AntPage::Cadence { cadence }));
        }
        if let Some(key) = bindings.enabled_device(AntSlot::Power) {
            out.push((
                key,
                AntPage::Power {
                    page: PowerPage::Standard,
                    power,
                    cadence: None,
                    speed: None,
                    distance_delta: 0.0,
                    work_delta: power * dt,
                },
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ant::device::{AntDeviceType, SlotBinding};

    fn dummy_bindings() -> AntSettings {
        let mut s = AntSettings::default();
        for (slot, t) in [
            (AntSlot::HeartRate, AntDeviceType::HeartRate),
            (AntSlot::Speed, AntDeviceType::SpeedAndCadence),
            (AntSlot::Power, AntDeviceType::Power),
        ] {
            s.slots.insert(slot, SlotBinding { enabled: true, device: Some(DeviceKey::new(0, t)) });
        }
        s
    }

    #[test]
    fn test_ranges_and_determinism() {
        let bindings = dummy_bindings();
        let mut a = DummyAnt::new(7, Duration::from_secs(1));
        let mut b = DummyAnt::new(7, Duration::from_secs(1));
        for _ in 0..50 {
            let pa = a.generate(&bindings, StopwatchStatus::Start);
            assert_eq!(pa, b.generate(&bindings, StopwatchStatus::Start));
            for (_, page) in pa {
                match page {
                    AntPage::HeartRate { heart_rate } => {
                        assert!((70.0..=150.0).contains(&heart_rate))
                    }
                    AntPage::Speed { speed, distance_delta } => {
                        assert!((5.0 / 3.6..=30.0 / 3.6).contains(&speed));
                        assert_eq!(distance_delta, speed);
                    }
                    AntPage::Power { power, .. } => assert!((0.0..=250.0).contains(&power)),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_no_accumulation_while_stopped() {
        let mut d = DummyAnt::new(1, Duration::from_secs(1));
        for (_, page) in d.generate(&dummy_bindings(), StopwatchStatus::Stop) {
            match page {
                AntPage::Speed { distance_delta, .. } => assert_eq!(distance_delta, 0.0),
                AntPage::Power { work_delta, .. } => assert_eq!(work_delta, 0.0),
                _ => {}
            }
        }
    }
}
