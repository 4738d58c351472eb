//! ANT+ device management.
//!
//! Slots move DISCONNECTED → SEARCHING → CONNECTED. A search lists every
//! compatible device heard on the wildcard channel; `connect` binds one of
//! them, persists the binding and enables its decoder. Devices already bound
//! to another slot (a power meter serving power, speed and cadence) share one
//! channel and one decoder.

pub mod decoder;
pub mod device;
pub mod dummy;

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

pub use decoder::{AntPage, DecodeError, Decoder, PowerPage};
pub use device::{AntDeviceType, AntSettings, AntSlot, DeviceKey, SlotBinding};

use crate::config::{BindingStore, Settings};
use crate::error::AntError;

pub type ChannelId = u8;

/// Hardware node abstraction. `start`/`stop` may block for seconds.
pub trait AntNode: Send {
    fn is_present(&self) -> bool;
    fn start(&mut self) -> Result<(), AntError>;
    fn stop(&mut self) -> Result<(), AntError>;
    fn open_channel(&mut self, device: DeviceKey) -> Result<ChannelId, AntError>;
    fn enable_channel(&mut self, channel: ChannelId) -> Result<(), AntError>;
    fn close_channel(&mut self, channel: ChannelId) -> Result<(), AntError>;
    fn begin_search(&mut self) -> Result<(), AntError>;
    fn end_search(&mut self) -> Result<(), AntError>;
}

/// Stand-in when no ANT+ USB stick / driver is available.
pub struct AbsentNode;

impl AntNode for AbsentNode {
    fn is_present(&self) -> bool {
        false
    }
    fn start(&mut self) -> Result<(), AntError> {
        Err(AntError::NotAvailable)
    }
    fn stop(&mut self) -> Result<(), AntError> {
        Ok(())
    }
    fn open_channel(&mut self, _device: DeviceKey) -> Result<ChannelId, AntError> {
        Err(AntError::NotAvailable)
    }
    fn enable_channel(&mut self, _channel: ChannelId) -> Result<(), AntError> {
        Err(AntError::NotAvailable)
    }
    fn close_channel(&mut self, _channel: ChannelId) -> Result<(), AntError> {
        Ok(())
    }
    fn begin_search(&mut self) -> Result<(), AntError> {
        Err(AntError::NotAvailable)
    }
    fn end_search(&mut self) -> Result<(), AntError> {
        Ok(())
    }
}

/// Where a received payload came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameSource {
    /// Wildcard search channel (extended 13-byte frames and 8-byte control frames)
    Search,
    Channel(ChannelId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AntFrame {
    pub source: FrameSource,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AntMode {
    Hardware,
    /// Synthetic data; explicit and logged at startup
    Dummy,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Disconnected,
    Searching,
    Connected(DeviceKey),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchCandidate {
    pub device_type: AntDeviceType,
    /// Already bound to another slot
    pub already_connected: bool,
}

#[derive(Clone, Debug)]
pub struct AntConfig {
    pub settings: AntSettings,
    pub wheel_circumference: f64,
    pub dummy: bool,
}

impl From<&Settings> for AntConfig {
    fn from(s: &Settings) -> Self {
        Self {
            settings: s.ant.clone(),
            wheel_circumference: s.wheel_circumference,
            dummy: s.dummy_output,
        }
    }
}

struct DeviceEntry {
    channel: Option<ChannelId>,
    decoder: Decoder,
    active: bool,
}

struct SearchSession {
    slot: AntSlot,
    results: BTreeMap<u16, SearchCandidate>,
}

pub struct AntManager {
    mode: AntMode,
    settings: AntSettings,
    circumference: f64,
    node: Box<dyn AntNode>,
    binding_store: Box<dyn BindingStore>,
    slots: BTreeMap<AntSlot, SlotState>,
    devices: HashMap<DeviceKey, DeviceEntry>,
    channels: HashMap<ChannelId, DeviceKey>,
    search: Option<SearchSession>,
}

impl AntManager {
    pub fn new(
        config: AntConfig,
        node: Box<dyn AntNode>,
        binding_store: Box<dyn BindingStore>,
    ) -> Self {
        let mode = if config.dummy {
            AntMode::Dummy
        } else if !config.settings.enabled {
            AntMode::Disabled
        } else if !node.is_present() {
            log::warn!("[ant] no ANT+ node found, falling back to dummy data");
            AntMode::Dummy
        } else {
            AntMode::Hardware
        };
        log::info!("[ant] mode: {:?}", mode);

        let mut mgr = Self {
            mode,
            settings: config.settings,
            circumference: config.wheel_circumference,
            node,
            binding_store,
            slots: AntSlot::ALL.iter().map(|s| (*s, SlotState::Disconnected)).collect(),
            devices: HashMap::new(),
            channels: HashMap::new(),
            search: None,
        };
        match mode {
            AntMode::Dummy => mgr.bind_dummy_devices(),
            AntMode::Hardware => mgr.restore_bindings(),
            AntMode::Disabled => {}
        }
        mgr
    }

    pub fn mode(&self) -> AntMode {
        self.mode
    }

    /// Effective bindings (dummy devices included).
    pub fn bindings(&self) -> &AntSettings {
        &self.settings
    }

    pub fn slot_state(&self, slot: AntSlot) -> SlotState {
        self.slots.get(&slot).copied().unwrap_or(SlotState::Disconnected)
    }

    /// Blocking; run on the blocking pool.
    pub fn start(&mut self) -> Result<(), AntError> {
        if self.mode == AntMode::Hardware {
            self.node.start()?;
        }
        Ok(())
    }

    /// Blocking; run on the blocking pool.
    pub fn stop(&mut self) -> Result<(), AntError> {
        if self.mode == AntMode::Hardware {
            if self.search.is_some() {
                self.node.end_search()?;
            }
            self.node.stop()?;
        }
        Ok(())
    }

    fn bind_dummy_devices(&mut self) {
        let dummy = [
            (AntSlot::HeartRate, AntDeviceType::HeartRate),
            (AntSlot::Speed, AntDeviceType::SpeedAndCadence),
            (AntSlot::Cadence, AntDeviceType::SpeedAndCadence),
            (AntSlot::Power, AntDeviceType::Power),
        ];
        let circumference = self.circumference;
        for (slot, device_type) in dummy {
            let key = DeviceKey::new(0, device_type);
            self.settings.slots.insert(slot, SlotBinding { enabled: true, device: Some(key) });
            self.slots.insert(slot, SlotState::Connected(key));
            self.devices.entry(key).or_insert_with(|| DeviceEntry {
                channel: None,
                decoder: Decoder::for_type(device_type, circumference),
                active: true,
            });
        }
        self.settings.slots.insert(AntSlot::Temperature, SlotBinding::default());
    }

    fn restore_bindings(&mut self) {
        for slot in AntSlot::ALL {
            let Some(key) = self.settings.enabled_device(slot) else { continue };
            if !slot.accepts(key.device_type) {
                log::warn!(
                    "[ant] stored binding {:?} for {:?} is incompatible, ignoring",
                    key,
                    slot
                );
                continue;
            }
            match self.enable_device(key) {
                Ok(()) => {
                    self.slots.insert(slot, SlotState::Connected(key));
                }
                Err(e) => log::warn!("[ant] could not reopen {:?} for {:?}: {}", key, slot, e),
            }
        }
    }

    fn enable_device(&mut self, key: DeviceKey) -> Result<(), AntError> {
        if let Some(entry) = self.devices.get_mut(&key) {
            if !entry.active {
                if let Some(ch) = entry.channel {
                    self.node.enable_channel(ch)?;
                }
                entry.active = true;
            }
            return Ok(());
        }
        let channel = match self.mode {
            AntMode::Hardware => {
                let ch = self.node.open_channel(key)?;
                self.channels.insert(ch, key);
                Some(ch)
            }
            _ => None,
        };
        self.devices.insert(
            key,
            DeviceEntry {
                channel,
                decoder: Decoder::for_type(key.device_type, self.circumference),
                active: true,
            },
        );
        Ok(())
    }

    /// Begin a device search for `slot`.
    pub fn search(&mut self, slot: AntSlot) -> Result<(), AntError> {
        if self.mode == AntMode::Disabled {
            return Err(AntError::NotAvailable);
        }
        if let Some(s) = &self.search {
            return Err(AntError::SearchBusy(s.slot));
        }
        if let SlotState::Connected(_) = self.slot_state(slot) {
            return Err(AntError::SlotBound(slot));
        }

        let mut results = BTreeMap::new();
        for other in AntSlot::ALL {
            if other == slot {
                continue;
            }
            if let Some(key) = self.settings.enabled_device(other) {
                if slot.accepts(key.device_type) {
                    results.insert(
                        key.id,
                        SearchCandidate { device_type: key.device_type, already_connected: true },
                    );
                }
            }
        }

        match self.mode {
            AntMode::Hardware => self.node.begin_search()?,
            _ => {
                let device_type = slot.compatible_types()[0];
                results
                    .entry(0)
                    .or_insert(SearchCandidate { device_type, already_connected: false });
            }
        }
        log::info!("[ant] searching for {:?}", slot);
        self.slots.insert(slot, SlotState::Searching);
        self.search = Some(SearchSession { slot, results });
        Ok(())
    }

    pub fn search_results(&self) -> Vec<(u16, SearchCandidate)> {
        self.search
            .as_ref()
            .map(|s| s.results.iter().map(|(id, c)| (*id, *c)).collect())
            .unwrap_or_default()
    }

    pub fn stop_search(&mut self) -> Result<(), AntError> {
        let Some(session) = self.search.take() else { return Ok(()) };
        if self.slot_state(session.slot) == SlotState::Searching {
            self.slots.insert(session.slot, SlotState::Disconnected);
        }
        log::info!("[ant] search for {:?} stopped", session.slot);
        if self.mode == AntMode::Hardware {
            self.node.end_search()?;
        }
        Ok(())
    }

    fn on_search_frame(&mut self, payload: &[u8]) {
        let Some(session) = self.search.as_mut() else { return };
        let found = match payload.len() {
            13 => {
                let id = u16::from_le_bytes([payload[9], payload[10]]);
                AntDeviceType::from_code(payload[11]).map(|t| (id, t))
            }
            8 => Some((u16::from_le_bytes([payload[1], payload[2]]), AntDeviceType::Control)),
            _ => None,
        };
        if let Some((id, device_type)) = found {
            if session.slot.accepts(device_type) {
                session
                    .results
                    .entry(id)
                    .or_insert(SearchCandidate { device_type, already_connected: false });
            }
        }
    }

    /// Bind `slot` to a device. Stops any running search.
    pub fn connect(
        &mut self,
        slot: AntSlot,
        id: u16,
        device_type: AntDeviceType,
    ) -> Result<(), AntError> {
        if !slot.accepts(device_type) {
            return Err(AntError::Incompatible { slot, device_type });
        }
        let key = DeviceKey::new(id, device_type);
        match self.slot_state(slot) {
            SlotState::Connected(current) if current == key => return Ok(()),
            SlotState::Connected(_) => return Err(AntError::SlotBound(slot)),
            _ => {}
        }
        self.stop_search()?;
        self.enable_device(key)?;
        self.settings.slots.insert(slot, SlotBinding { enabled: true, device: Some(key) });
        self.slots.insert(slot, SlotState::Connected(key));
        log::info!("[ant] {:?} connected to {:?} #{}", slot, device_type, id);
        self.persist()
    }

    /// Unbind the device serving `slot` from every slot it serves.
    pub fn disconnect(&mut self, slot: AntSlot) -> Result<Option<DeviceKey>, AntError> {
        let SlotState::Connected(key) = self.slot_state(slot) else { return Ok(None) };
        // nothing changes unless the node released the channel
        if let Some(ch) = self.devices.get(&key).and_then(|e| e.channel) {
            self.node.close_channel(ch)?;
        }
        for s in AntSlot::ALL {
            if self.slot_state(s) == SlotState::Connected(key) {
                self.slots.insert(s, SlotState::Disconnected);
                self.settings.slots.insert(s, SlotBinding::default());
                log::info!("[ant] {:?} disconnected from {:?} #{}", s, key.device_type, key.id);
            }
        }
        if let Some(entry) = self.devices.get_mut(&key) {
            entry.active = false;
        }
        self.persist()?;
        Ok(Some(key))
    }

    fn persist(&mut self) -> Result<(), AntError> {
        if self.mode == AntMode::Dummy {
            return Ok(());
        }
        self.binding_store.save(&self.settings)?;
        Ok(())
    }

    /// Route one received payload. Malformed frames are dropped.
    pub fn handle_frame(&mut self, frame: &AntFrame, now: Instant) -> Vec<(DeviceKey, AntPage)> {
        let channel = match frame.source {
            FrameSource::Search => {
                self.on_search_frame(&frame.payload);
                return Vec::new();
            }
            FrameSource::Channel(ch) => ch,
        };
        let Some(key) = self.channels.get(&channel).copied() else {
            log::debug!("[ant] frame on unknown channel {}", channel);
            return Vec::new();
        };
        self.decode(key, &frame.payload, now)
    }

    /// Decode a payload for a known device (dummy mode feeds this directly).
    pub fn decode(
        &mut self,
        key: DeviceKey,
        payload: &[u8],
        now: Instant,
    ) -> Vec<(DeviceKey, AntPage)> {
        let Some(entry) = self.devices.get_mut(&key).filter(|e| e.active) else {
            return Vec::new();
        };
        match entry.decoder.decode(payload, now) {
            Ok(pages) => pages.into_iter().map(|p| (key, p)).collect(),
            Err(e) => {
                log::debug!("[ant] dropped frame from {:?} #{}: {}", key.device_type, key.id, e);
                Vec::new()
            }
        }
    }

    /// Forget decoder counter history (session reset).
    pub fn reset(&mut self) {
        for entry in self.devices.values_mut() {
            entry.decoder.reset();
        }
    }
}
