use std::fmt;

use serde::Serialize;

/// Temperature stored as Celsius internally.
/// The cloud API carries temperatures as tenths of a degree.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Temperature(f64);

impl Temperature {
    pub fn from_celsius(c: f64) -> Self {
        Self(c)
    }

    /// Construct from the vendor's tenths-of-a-degree encoding.
    pub fn from_deci_celsius(raw: i64) -> Self {
        Self(raw as f64 / 10.0)
    }

    pub fn celsius(&self) -> f64 {
        self.0
    }

    /// Round to device precision (0.5 increments).
    pub fn to_device_celsius(&self) -> f64 {
        (self.0 * 2.0).round() / 2.0
    }

    /// Encode for the wire: device precision, in tenths of a degree.
    pub fn to_deci_celsius(&self) -> i64 {
        (self.to_device_celsius() * 10.0).round() as i64
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}\u{00b0}C", self.0)
    }
}

/// Cloud-assigned device identifier. The API sends integers today but
/// older firmware reported strings, so it is kept textual.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for DeviceId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub humidifier: bool,
}

/// A breezer as reported by the device listing. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub model: Option<String>,
    pub capabilities: Capabilities,
}

impl Device {
    pub fn has_humidifier(&self) -> bool {
        self.capabilities.humidifier
    }
}

/// Fan speed, always within 1..=7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FanSpeed(u8);

impl FanSpeed {
    pub const MIN: FanSpeed = FanSpeed(1);
    pub const MAX: FanSpeed = FanSpeed(7);

    pub fn new(speed: u8) -> Option<Self> {
        (Self::MIN.0..=Self::MAX.0)
            .contains(&speed)
            .then_some(Self(speed))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

/// Air path selected by the damper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    /// Supply ventilation: outside air only.
    Ventilation,
    Recirculation,
    Mixed,
    /// Supply valve open, fan idle.
    FreshAir,
}

impl Mode {
    pub const ALL: [Mode; 4] = [
        Mode::Ventilation,
        Mode::Recirculation,
        Mode::Mixed,
        Mode::FreshAir,
    ];

    pub fn as_vendor_code(&self) -> u8 {
        match self {
            Mode::Ventilation => 0,
            Mode::Recirculation => 1,
            Mode::Mixed => 2,
            Mode::FreshAir => 3,
        }
    }

    pub fn from_vendor_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Mode::Ventilation),
            1 => Some(Mode::Recirculation),
            2 => Some(Mode::Mixed),
            3 => Some(Mode::FreshAir),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Mode::Ventilation => "supply ventilation",
            Mode::Recirculation => "recirculation",
            Mode::Mixed => "mixed mode",
            Mode::FreshAir => "supply valve",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        Mode::ALL.into_iter().find(|m| m.label() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HumidifierStage {
    Off,
    Stage1,
    Stage2,
    Stage3,
}

impl HumidifierStage {
    pub const ALL: [HumidifierStage; 4] = [
        HumidifierStage::Off,
        HumidifierStage::Stage1,
        HumidifierStage::Stage2,
        HumidifierStage::Stage3,
    ];

    pub fn as_vendor_code(&self) -> u8 {
        match self {
            HumidifierStage::Off => 0,
            HumidifierStage::Stage1 => 1,
            HumidifierStage::Stage2 => 2,
            HumidifierStage::Stage3 => 3,
        }
    }

    pub fn from_vendor_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(HumidifierStage::Off),
            1 => Some(HumidifierStage::Stage1),
            2 => Some(HumidifierStage::Stage2),
            3 => Some(HumidifierStage::Stage3),
            _ => None,
        }
    }

    /// The percentage this stage is displayed as on a 0..100 slider.
    pub fn anchor_percent(&self) -> u8 {
        match self {
            HumidifierStage::Off => 0,
            HumidifierStage::Stage1 => 33,
            HumidifierStage::Stage2 => 66,
            HumidifierStage::Stage3 => 100,
        }
    }

    pub fn option(&self) -> &'static str {
        match self {
            HumidifierStage::Off => "off",
            HumidifierStage::Stage1 => "1",
            HumidifierStage::Stage2 => "2",
            HumidifierStage::Stage3 => "3",
        }
    }

    pub fn from_option(s: &str) -> Option<Self> {
        HumidifierStage::ALL.into_iter().find(|h| h.option() == s)
    }
}

/// Normalized state of one device. Replaced wholesale on every poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub online: bool,
    pub power: bool,
    pub fan_speed: FanSpeed,
    pub mode: Mode,
    pub target_temperature: Option<Temperature>,
    pub current_temperature: Option<Temperature>,
    pub current_humidity: Option<f64>,
    /// `None` when the device has no humidifier.
    pub humidifier: Option<HumidifierStage>,
}

impl DeviceState {
    pub fn humidifier_percent(&self) -> Option<u8> {
        self.humidifier.map(|h| h.anchor_percent())
    }
}

/// Emitted by the coordinator when published state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceAdded { device_id: DeviceId, name: String },
    DeviceRemoved { device_id: DeviceId },
    OnlineChanged { device_id: DeviceId, online: bool },
    PowerChanged { device_id: DeviceId, on: bool },
    FanSpeedChanged { device_id: DeviceId, speed: FanSpeed },
    ModeChanged { device_id: DeviceId, mode: Mode },
    TargetTemperatureChanged { device_id: DeviceId, temp: Option<Temperature> },
    TemperatureChanged { device_id: DeviceId, temp: Option<Temperature> },
    HumidityChanged { device_id: DeviceId, humidity: Option<f64> },
    HumidifierChanged { device_id: DeviceId, stage: Option<HumidifierStage> },
}

impl Event {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Event::DeviceAdded { device_id, .. }
            | Event::DeviceRemoved { device_id }
            | Event::OnlineChanged { device_id, .. }
            | Event::PowerChanged { device_id, .. }
            | Event::FanSpeedChanged { device_id, .. }
            | Event::ModeChanged { device_id, .. }
            | Event::TargetTemperatureChanged { device_id, .. }
            | Event::TemperatureChanged { device_id, .. }
            | Event::HumidityChanged { device_id, .. }
            | Event::HumidifierChanged { device_id, .. } => device_id,
        }
    }
}
