use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ANT+ device type byte as broadcast in the channel ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AntDeviceType {
    HeartRate,
    SpeedAndCadence,
    Cadence,
    Speed,
    Power,
    Light,
    Control,
    Temperature,
}

impl AntDeviceType {
    pub fn code(self) -> u8 {
        match self {
            AntDeviceType::HeartRate => 0x78,
            AntDeviceType::SpeedAndCadence => 0x79,
            AntDeviceType::Cadence => 0x7A,
            AntDeviceType::Speed => 0x7B,
            AntDeviceType::Power => 0x0B,
            AntDeviceType::Light => 0x23,
            AntDeviceType::Control => 0x10,
            AntDeviceType::Temperature => 0x19,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x78 => AntDeviceType::HeartRate,
            0x79 => AntDeviceType::SpeedAndCadence,
            0x7A => AntDeviceType::Cadence,
            0x7B => AntDeviceType::Speed,
            0x0B => AntDeviceType::Power,
            0x23 => AntDeviceType::Light,
            0x10 => AntDeviceType::Control,
            0x19 => AntDeviceType::Temperature,
            _ => return None,
        })
    }
}

/// A logical sensor role on the head unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AntSlot {
    HeartRate,
    Speed,
    Cadence,
    Power,
    Light,
    Control,
    Temperature,
}

impl AntSlot {
    pub const ALL: [AntSlot; 7] = [
        AntSlot::HeartRate,
        AntSlot::Speed,
        AntSlot::Cadence,
        AntSlot::Power,
        AntSlot::Light,
        AntSlot::Control,
        AntSlot::Temperature,
    ];

    /// Device types able to serve this slot.
    pub fn compatible_types(self) -> &'static [AntDeviceType] {
        use AntDeviceType::*;
        match self {
            AntSlot::HeartRate => &[HeartRate],
            AntSlot::Speed => &[SpeedAndCadence, Speed, Power],
            AntSlot::Cadence => &[SpeedAndCadence, Cadence, Power],
            AntSlot::Power => &[Power],
            AntSlot::Light => &[Light],
            AntSlot::Control => &[Control],
            AntSlot::Temperature => &[Temperature],
        }
    }

    pub fn accepts(self, device_type: AntDeviceType) -> bool {
        self.compatible_types().contains(&device_type)
    }
}

/// Identity of a physical device: 16-bit device number plus type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub id: u16,
    pub device_type: AntDeviceType,
}

impl DeviceKey {
    pub fn new(id: u16, device_type: AntDeviceType) -> Self {
        Self { id, device_type }
    }
}

/// Persisted binding of one slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBinding {
    pub enabled: bool,
    pub device: Option<DeviceKey>,
}

/// Persisted ANT+ state: global switch plus every slot binding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntSettings {
    pub enabled: bool,
    pub slots: BTreeMap<AntSlot, SlotBinding>,
}

impl Default for AntSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            slots: AntSlot::ALL.iter().map(|s| (*s, SlotBinding::default())).collect(),
        }
    }
}

impl AntSettings {
    pub fn binding(&self, slot: AntSlot) -> SlotBinding {
        self.slots.get(&slot).copied().unwrap_or_default()
    }

    /// The bound device, if the slot is enabled.
    pub fn enabled_device(&self, slot: AntSlot) -> Option<DeviceKey> {
        let b = self.binding(slot);
        if b.enabled { b.device } else { None }
    }

    pub fn is_enabled(&self, slot: AntSlot) -> bool {
        self.enabled_device(slot).is_some()
    }
}
