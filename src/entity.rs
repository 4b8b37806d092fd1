//! Host-facing projections of the published snapshot.
//!
//! Everything here is derived from `DeviceSnapshot` on demand; no entity
//! holds state of its own.

use serde::Serialize;

use crate::coordinator::{DeviceSnapshot, Snapshot};
use crate::normalize::{MAX_TARGET_CELSIUS, MIN_TARGET_CELSIUS};
use crate::types::{DeviceId, FanSpeed, HumidifierStage, Mode};

pub const MANUFACTURER: &str = "Atmeex";
pub const DEFAULT_MODEL: &str = "Brizer";
pub const TARGET_TEMPERATURE_STEP: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Heat,
    Off,
}

impl HvacMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HvacMode::Heat => "heat",
            HvacMode::Off => "off",
        }
    }
}

/// The composite climate entity: power, fan, mode, target temperature and
/// humidifier in one place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlEntity {
    pub unique_id: String,
    pub name: String,
    pub device_id: DeviceId,
    pub manufacturer: &'static str,
    pub model: String,
    pub available: bool,
    pub hvac_mode: Option<HvacMode>,
    pub hvac_modes: [HvacMode; 2],
    pub fan_mode: Option<String>,
    pub fan_modes: Vec<String>,
    pub mode: Option<&'static str>,
    pub mode_options: Vec<&'static str>,
    pub target_temperature: Option<f64>,
    pub current_temperature: Option<f64>,
    pub current_humidity: Option<f64>,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub temperature_step: f64,
    /// Anchor percentage of the current stage; `None` without a humidifier.
    pub humidifier_level: Option<u8>,
    pub humidifier_option: Option<&'static str>,
    pub humidifier_options: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Online,
}

impl SensorKind {
    fn suffix(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Online => "online",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum SensorValue {
    Celsius(f64),
    Percent(f64),
    Bool(bool),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorEntity {
    pub unique_id: String,
    pub name: String,
    pub device_id: DeviceId,
    pub kind: SensorKind,
    pub value: SensorValue,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectKind {
    HumidifierStage,
    BreezerMode,
}

/// Option pickers for the humidifier stage and the breezer mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectEntity {
    pub unique_id: String,
    pub name: String,
    pub device_id: DeviceId,
    pub kind: SelectKind,
    /// Attribute to pass back to `submit_command` with the chosen option.
    pub attribute: &'static str,
    pub options: Vec<&'static str>,
    pub current: Option<&'static str>,
    pub available: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntitySet {
    pub controls: Vec<ControlEntity>,
    pub sensors: Vec<SensorEntity>,
    pub selects: Vec<SelectEntity>,
}

fn fan_modes() -> Vec<String> {
    (FanSpeed::MIN.get()..=FanSpeed::MAX.get())
        .map(|s| s.to_string())
        .collect()
}

fn mode_options() -> Vec<&'static str> {
    Mode::ALL.iter().map(Mode::label).collect()
}

fn humidifier_options() -> Vec<&'static str> {
    HumidifierStage::ALL.iter().map(HumidifierStage::option).collect()
}

fn available(snapshot: &DeviceSnapshot) -> bool {
    snapshot.state.as_ref().is_some_and(|s| s.online)
}

pub fn control_entity(snapshot: &DeviceSnapshot) -> ControlEntity {
    let device = &snapshot.device;
    let state = snapshot.state.as_ref();
    let has_humidifier = device.has_humidifier();

    ControlEntity {
        unique_id: format!("atmeex_climate_{}", device.id),
        name: device.name.clone(),
        device_id: device.id.clone(),
        manufacturer: MANUFACTURER,
        model: device
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        available: available(snapshot),
        hvac_mode: state.map(|s| if s.power { HvacMode::Heat } else { HvacMode::Off }),
        hvac_modes: [HvacMode::Heat, HvacMode::Off],
        fan_mode: state.map(|s| s.fan_speed.get().to_string()),
        fan_modes: fan_modes(),
        mode: state.map(|s| s.mode.label()),
        mode_options: mode_options(),
        target_temperature: state
            .and_then(|s| s.target_temperature)
            .map(|t| t.to_device_celsius()),
        current_temperature: state
            .and_then(|s| s.current_temperature)
            .map(|t| t.celsius()),
        current_humidity: state.and_then(|s| s.current_humidity),
        min_temperature: MIN_TARGET_CELSIUS,
        max_temperature: MAX_TARGET_CELSIUS,
        temperature_step: TARGET_TEMPERATURE_STEP,
        humidifier_level: state.and_then(|s| s.humidifier_percent()),
        humidifier_option: state.and_then(|s| s.humidifier).map(|h| h.option()),
        humidifier_options: if has_humidifier {
            humidifier_options()
        } else {
            Vec::new()
        },
    }
}

pub fn sensor_entities(snapshot: &DeviceSnapshot) -> Vec<SensorEntity> {
    let device = &snapshot.device;
    let state = snapshot.state.as_ref();

    [SensorKind::Temperature, SensorKind::Humidity, SensorKind::Online]
        .into_iter()
        .map(|kind| {
            let value = match kind {
                SensorKind::Temperature => state
                    .and_then(|s| s.current_temperature)
                    .map_or(SensorValue::Unknown, |t| SensorValue::Celsius(t.celsius())),
                SensorKind::Humidity => state
                    .and_then(|s| s.current_humidity)
                    .map_or(SensorValue::Unknown, SensorValue::Percent),
                SensorKind::Online => SensorValue::Bool(state.is_some_and(|s| s.online)),
            };
            SensorEntity {
                unique_id: format!("atmeex_{}_{}", device.id, kind.suffix()),
                name: format!("{} {}", device.name, kind.suffix()),
                device_id: device.id.clone(),
                kind,
                value,
                // The online sensor itself stays available to report `false`.
                available: kind == SensorKind::Online || available(snapshot),
            }
        })
        .collect()
}

pub fn select_entities(snapshot: &DeviceSnapshot) -> Vec<SelectEntity> {
    let device = &snapshot.device;
    let state = snapshot.state.as_ref();
    let mut selects = Vec::with_capacity(2);

    if device.has_humidifier() {
        selects.push(SelectEntity {
            unique_id: format!("{}_hum_mode", device.id),
            name: format!("{} humidification mode", device.name),
            device_id: device.id.clone(),
            kind: SelectKind::HumidifierStage,
            attribute: "humidifier_stage",
            options: humidifier_options(),
            current: state.and_then(|s| s.humidifier).map(|h| h.option()),
            available: available(snapshot),
        });
    }
    selects.push(SelectEntity {
        unique_id: format!("{}_brizer_mode", device.id),
        name: format!("{} breezer mode", device.name),
        device_id: device.id.clone(),
        kind: SelectKind::BreezerMode,
        attribute: "mode",
        options: mode_options(),
        current: state.map(|s| s.mode.label()),
        available: available(snapshot),
    });
    selects
}

pub fn entities(snapshot: &Snapshot) -> EntitySet {
    let mut set = EntitySet::default();
    for device in snapshot.devices() {
        set.controls.push(control_entity(device));
        set.sensors.extend(sensor_entities(device));
        set.selects.extend(select_entities(device));
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Capabilities, Device, DeviceState, Temperature};

    fn snapshot(humidifier: bool, state: Option<DeviceState>) -> DeviceSnapshot {
        DeviceSnapshot {
            device: Device {
                id: DeviceId::from(12u64),
                name: "Nursery".to_string(),
                model: None,
                capabilities: Capabilities { humidifier },
            },
            state,
        }
    }

    fn state() -> DeviceState {
        DeviceState {
            online: true,
            power: true,
            fan_speed: FanSpeed::new(3).unwrap(),
            mode: Mode::Recirculation,
            target_temperature: Some(Temperature::from_celsius(21.3)),
            current_temperature: Some(Temperature::from_celsius(19.8)),
            current_humidity: None,
            humidifier: Some(HumidifierStage::Stage2),
        }
    }

    #[test]
    fn control_entity_projects_state() {
        let e = control_entity(&snapshot(true, Some(state())));
        assert_eq!(e.unique_id, "atmeex_climate_12");
        assert_eq!(e.model, "Brizer");
        assert_eq!(e.manufacturer, "Atmeex");
        assert!(e.available);
        assert_eq!(e.hvac_mode, Some(HvacMode::Heat));
        assert_eq!(e.fan_mode.as_deref(), Some("3"));
        assert_eq!(e.fan_modes, vec!["1", "2", "3", "4", "5", "6", "7"]);
        assert_eq!(e.mode, Some("recirculation"));
        assert_eq!(e.target_temperature, Some(21.5));
        assert_eq!(e.humidifier_level, Some(66));
        assert_eq!(e.humidifier_option, Some("2"));
        assert_eq!(e.humidifier_options, vec!["off", "1", "2", "3"]);
        assert_eq!((e.min_temperature, e.max_temperature), (10.0, 30.0));
    }

    #[test]
    fn powered_off_is_hvac_off() {
        let mut s = state();
        s.power = false;
        let e = control_entity(&snapshot(true, Some(s)));
        assert_eq!(e.hvac_mode, Some(HvacMode::Off));
    }

    #[test]
    fn device_without_state_is_unavailable() {
        let e = control_entity(&snapshot(false, None));
        assert!(!e.available);
        assert_eq!(e.hvac_mode, None);
        assert!(e.humidifier_options.is_empty());
    }

    #[test]
    fn sensors_cover_temperature_humidity_online() {
        let mut s = state();
        s.online = false;
        let sensors = sensor_entities(&snapshot(false, Some(s)));
        let ids: Vec<&str> = sensors.iter().map(|s| s.unique_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["atmeex_12_temperature", "atmeex_12_humidity", "atmeex_12_online"]
        );
        assert_eq!(sensors[1].value, SensorValue::Unknown);
        assert_eq!(sensors[2].value, SensorValue::Bool(false));
        assert!(sensors[2].available);
        assert!(!sensors[0].available);
    }

    #[test]
    fn selects_skip_humidifier_when_absent() {
        let selects = select_entities(&snapshot(false, Some(state())));
        assert_eq!(selects.len(), 1);
        assert_eq!(selects[0].kind, SelectKind::BreezerMode);
        assert_eq!(selects[0].current, Some("recirculation"));

        let selects = select_entities(&snapshot(true, Some(state())));
        assert_eq!(selects[0].unique_id, "12_hum_mode");
        assert_eq!(selects[0].current, Some("2"));
    }
}
