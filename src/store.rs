//! Latest value of every sensor, written only by the integration task.
//!
//! Producers never touch the store directly; they send `SensorMessage`s that
//! the integration task applies between ticks. Unknown values are `None`,
//! never NaN or zero.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::ant::{AntPage, AntSettings, AntSlot, DeviceKey, PowerPage};
use crate::gps::GpsValues;
use crate::types::{ImuValues, Stamped};

#[derive(Clone, Debug, PartialEq)]
pub enum SensorMessage {
    Ant { device: DeviceKey, page: AntPage, at: Instant },
    Bindings(AntSettings),
    Gps(GpsValues),
    Imu(ImuValues),
}

/// Latest record of one power meter page, with its own running totals.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PowerRecord {
    pub power: f64,
    pub cadence: Option<f64>,
    pub speed: Option<f64>,
    /// m
    pub distance: f64,
    /// J
    pub accumulated_power: f64,
    pub at: Instant,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceValues {
    pub heart_rate: Option<Stamped<f64>>,
    pub speed: Option<Stamped<f64>>,
    pub cadence: Option<Stamped<f64>>,
    /// m
    pub distance: f64,
    pub power: BTreeMap<PowerPage, PowerRecord>,
    pub temperature: Option<Stamped<f64>>,
    pub light_mode: Option<Stamped<u8>>,
    pub control_command: Option<Stamped<u16>>,
}

impl DeviceValues {
    fn apply(&mut self, page: AntPage, at: Instant) {
        match page {
            AntPage::HeartRate { heart_rate } => {
                self.heart_rate = Some(Stamped::new(heart_rate, at))
            }
            AntPage::Speed { speed, distance_delta } => {
                self.speed = Some(Stamped::new(speed, at));
                self.distance += distance_delta;
            }
            AntPage::Cadence { cadence } => self.cadence = Some(Stamped::new(cadence, at)),
            AntPage::Power { page, power, cadence, speed, distance_delta, work_delta } => {
                let rec = self.power.entry(page).or_insert(PowerRecord {
                    power,
                    cadence,
                    speed,
                    distance: 0.0,
                    accumulated_power: 0.0,
                    at,
                });
                rec.power = power;
                rec.cadence = cadence;
                rec.speed = speed;
                rec.distance += distance_delta;
                rec.accumulated_power += work_delta;
                rec.at = at;
            }
            AntPage::Temperature { celsius } => self.temperature = Some(Stamped::new(celsius, at)),
            AntPage::Light { mode } => self.light_mode = Some(Stamped::new(mode, at)),
            AntPage::Control { command } => self.control_command = Some(Stamped::new(command, at)),
        }
    }

    fn reset_totals(&mut self) {
        self.distance = 0.0;
        for rec in self.power.values_mut() {
            rec.distance = 0.0;
            rec.accumulated_power = 0.0;
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SensorStore {
    devices: HashMap<DeviceKey, DeviceValues>,
    bindings: AntSettings,
    pub gps: GpsValues,
    pub imu: ImuValues,
}

impl SensorStore {
    pub fn new(bindings: AntSettings) -> Self {
        Self { bindings, ..Self::default() }
    }

    pub fn apply(&mut self, msg: SensorMessage) {
        match msg {
            SensorMessage::Ant { device, page, at } => {
                self.devices.entry(device).or_default().apply(page, at);
            }
            SensorMessage::Bindings(b) => self.bindings = b,
            SensorMessage::Gps(v) => self.gps = v,
            SensorMessage::Imu(v) => self.imu = v,
        }
    }

    pub fn bindings(&self) -> &AntSettings {
        &self.bindings
    }

    /// The enabled device bound to `slot` and its values (possibly none yet).
    pub fn slot(&self, slot: AntSlot) -> Option<(DeviceKey, Option<&DeviceValues>)> {
        let key = self.bindings.enabled_device(slot)?;
        Some((key, self.devices.get(&key)))
    }

    pub fn device(&self, key: &DeviceKey) -> Option<&DeviceValues> {
        self.devices.get(key)
    }

    /// Zero distance and work totals for a new session.
    pub fn reset_totals(&mut self) {
        for dev in self.devices.values_mut() {
            dev.reset_totals();
        }
        self.gps.distance = 0.0;
    }
}
