//! Mapping between the cloud's loosely typed state payloads and the
//! normalized model, in both directions. Nothing here touches the network.

use serde_json::Value;

use crate::error::{NormalizationError, ValidationError};
use crate::protocol::{
    self, COND_DAMPER, COND_FAN_SPEED, COND_HUMIDIFIER, COND_HUMIDITY, COND_POWER,
    COND_TARGET_TEMP, COND_TEMP_IN, FIELD_DAMPER, FIELD_FAN_SPEED, FIELD_HUMIDIFIER, FIELD_POWER,
    FIELD_TARGET_TEMP, TEMPERATURE_SENTINEL,
};
use crate::types::{Device, DeviceState, FanSpeed, HumidifierStage, Mode, Temperature};

pub const MIN_TARGET_CELSIUS: f64 = 10.0;
pub const MAX_TARGET_CELSIUS: f64 = 30.0;

/// A vendor field as it arrived on the wire.
#[derive(Debug, Clone, PartialEq)]
enum Raw<T> {
    Value(T),
    Unrecognized(String),
    Missing,
}

/// Integer codes may arrive as numbers, numeric strings or booleans.
fn read_code(v: Option<&Value>) -> Raw<i64> {
    match v {
        None | Some(Value::Null) => Raw::Missing,
        Some(Value::Bool(b)) => Raw::Value(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Raw::Value(i),
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Raw::Value(f as i64),
                _ => Raw::Unrecognized(n.to_string()),
            },
        },
        Some(Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Raw::Value(i),
            Err(_) => Raw::Unrecognized(s.clone()),
        },
        Some(other) => Raw::Unrecognized(other.to_string()),
    }
}

fn read_number(v: Option<&Value>) -> Raw<f64> {
    match v {
        None | Some(Value::Null) => Raw::Missing,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) => Raw::Value(f),
            None => Raw::Unrecognized(n.to_string()),
        },
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(f) if f.is_finite() => Raw::Value(f),
            _ => Raw::Unrecognized(s.clone()),
        },
        Some(other) => Raw::Unrecognized(other.to_string()),
    }
}

fn is_sentinel(raw: f64) -> bool {
    (raw - TEMPERATURE_SENTINEL as f64).abs() < f64::EPSILON
}

/// Prefer the user setting, fall back to the live condition.
fn setting_or_condition<'a>(raw: &'a Value, setting: &str, condition: &str) -> Option<&'a Value> {
    raw.get("settings")
        .and_then(|s| s.get(setting))
        .filter(|v| !v.is_null())
        .or_else(|| raw.get("condition").and_then(|c| c.get(condition)))
}

fn required_code(v: Option<&Value>, field: &'static str) -> Result<i64, NormalizationError> {
    match read_code(v) {
        Raw::Value(i) => Ok(i),
        Raw::Unrecognized(raw) => Err(NormalizationError::Unrecognized { field, raw }),
        Raw::Missing => Err(NormalizationError::MissingField { field }),
    }
}

fn temperature(
    v: Option<&Value>,
    field: &'static str,
    zero_is_unset: bool,
) -> Result<Option<Temperature>, NormalizationError> {
    match read_number(v) {
        Raw::Value(n) if is_sentinel(n) => Ok(None),
        Raw::Value(n) if zero_is_unset && n == 0.0 => Ok(None),
        Raw::Value(n) => Ok(Some(Temperature::from_celsius(n / 10.0))),
        Raw::Unrecognized(raw) => Err(NormalizationError::Unrecognized { field, raw }),
        Raw::Missing => Ok(None),
    }
}

/// Build a complete `DeviceState` from one state payload.
///
/// Either every field maps cleanly or the whole payload is rejected;
/// callers keep the previous state on error.
pub fn normalize_state(device: &Device, raw: &Value) -> Result<DeviceState, NormalizationError> {
    if !raw.is_object() {
        return Err(NormalizationError::NotAnObject);
    }

    let online = match read_code(raw.get("online")) {
        Raw::Value(v) => v != 0,
        Raw::Missing => true,
        Raw::Unrecognized(raw) => {
            return Err(NormalizationError::Unrecognized {
                field: "online",
                raw,
            });
        }
    };

    let power_code = required_code(
        setting_or_condition(raw, FIELD_POWER, COND_POWER),
        FIELD_POWER,
    )?;
    let power = match power_code {
        0 => false,
        1 => true,
        other => {
            return Err(NormalizationError::Unrecognized {
                field: FIELD_POWER,
                raw: other.to_string(),
            });
        }
    };

    let fan_raw = required_code(
        setting_or_condition(raw, FIELD_FAN_SPEED, COND_FAN_SPEED),
        FIELD_FAN_SPEED,
    )?;
    // Powered-off units report speed 0.
    let fan_speed = match fan_raw {
        0 => FanSpeed::MIN,
        n => u8::try_from(n)
            .ok()
            .and_then(FanSpeed::new)
            .ok_or_else(|| NormalizationError::Unrecognized {
                field: FIELD_FAN_SPEED,
                raw: n.to_string(),
            })?,
    };

    let damper = required_code(
        setting_or_condition(raw, FIELD_DAMPER, COND_DAMPER),
        FIELD_DAMPER,
    )?;
    let mode = Mode::from_vendor_code(damper).ok_or_else(|| NormalizationError::Unrecognized {
        field: FIELD_DAMPER,
        raw: damper.to_string(),
    })?;

    // An unset or sentinel setpoint falls back to the one the unit reports.
    let target_temperature = match temperature(
        raw.pointer(&format!("/settings/{FIELD_TARGET_TEMP}")),
        FIELD_TARGET_TEMP,
        true,
    )? {
        Some(t) => Some(t),
        None => temperature(
            raw.pointer(&format!("/condition/{COND_TARGET_TEMP}")),
            COND_TARGET_TEMP,
            true,
        )?,
    };
    let current_temperature = temperature(
        raw.pointer(&format!("/condition/{COND_TEMP_IN}")),
        COND_TEMP_IN,
        false,
    )?;

    let current_humidity = match read_number(raw.pointer(&format!("/condition/{COND_HUMIDITY}"))) {
        Raw::Value(h) if is_sentinel(h) => None,
        Raw::Value(h) => Some(h),
        Raw::Missing => None,
        Raw::Unrecognized(raw) => {
            return Err(NormalizationError::Unrecognized {
                field: COND_HUMIDITY,
                raw,
            });
        }
    };

    let humidifier = if device.has_humidifier() {
        let code = required_code(
            setting_or_condition(raw, FIELD_HUMIDIFIER, COND_HUMIDIFIER),
            FIELD_HUMIDIFIER,
        )?;
        Some(
            HumidifierStage::from_vendor_code(code).ok_or_else(|| {
                NormalizationError::Unrecognized {
                    field: FIELD_HUMIDIFIER,
                    raw: code.to_string(),
                }
            })?,
        )
    } else {
        None
    };

    Ok(DeviceState {
        online,
        power,
        fan_speed,
        mode,
        target_temperature,
        current_temperature,
        current_humidity,
        humidifier,
    })
}

/// Snap a 0..100 slider value to the nearest stage anchor (0, 33, 66, 100).
/// Exact midpoints go to the lower stage; out-of-range input is clamped.
pub fn quantize_humidifier(percent: f64) -> HumidifierStage {
    let p = if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    };

    let mut best = HumidifierStage::Off;
    let mut best_distance = f64::INFINITY;
    for stage in HumidifierStage::ALL {
        let distance = (p - f64::from(stage.anchor_percent())).abs();
        if distance < best_distance {
            best = stage;
            best_distance = distance;
        }
    }
    best
}

/// A platform-issued change to one attribute of a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Power(bool),
    FanSpeed(i64),
    Mode(Mode),
    TargetTemperature(f64),
    /// Slider percentage, quantized before sending.
    HumidifierLevel(f64),
    HumidifierStage(HumidifierStage),
}

impl Command {
    /// Parse the host's `(attribute, value)` form.
    pub fn parse(attribute: &str, value: &Value) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::Value {
            attribute: attribute.to_string(),
            value: value.to_string(),
        };

        match attribute {
            "power" => match value {
                Value::Bool(b) => Ok(Command::Power(*b)),
                Value::String(s) if s == "on" => Ok(Command::Power(true)),
                Value::String(s) if s == "off" => Ok(Command::Power(false)),
                _ => match read_code(Some(value)) {
                    Raw::Value(0) => Ok(Command::Power(false)),
                    Raw::Value(1) => Ok(Command::Power(true)),
                    _ => Err(invalid()),
                },
            },
            "hvac_mode" => match value.as_str() {
                Some("heat") => Ok(Command::Power(true)),
                Some("off") => Ok(Command::Power(false)),
                _ => Err(invalid()),
            },
            "fan_speed" => match read_code(Some(value)) {
                Raw::Value(n) => Ok(Command::FanSpeed(n)),
                _ => Err(invalid()),
            },
            "mode" => {
                if let Some(label) = value.as_str()
                    && let Some(mode) = Mode::from_label(label)
                {
                    return Ok(Command::Mode(mode));
                }
                match read_code(Some(value)) {
                    Raw::Value(code) => Mode::from_vendor_code(code)
                        .map(Command::Mode)
                        .ok_or_else(|| ValidationError::Mode(code.to_string())),
                    _ => Err(ValidationError::Mode(
                        value.as_str().map_or_else(|| value.to_string(), str::to_string),
                    )),
                }
            }
            "target_temperature" => match read_number(Some(value)) {
                Raw::Value(t) => Ok(Command::TargetTemperature(t)),
                _ => Err(invalid()),
            },
            "humidifier" => match read_number(Some(value)) {
                Raw::Value(p) => Ok(Command::HumidifierLevel(p)),
                _ => Err(invalid()),
            },
            "humidifier_stage" => {
                if let Some(stage) = value.as_str().and_then(HumidifierStage::from_option) {
                    return Ok(Command::HumidifierStage(stage));
                }
                match read_code(Some(value)) {
                    Raw::Value(code) => HumidifierStage::from_vendor_code(code)
                        .map(Command::HumidifierStage)
                        .ok_or_else(invalid),
                    _ => Err(invalid()),
                }
            }
            other => Err(ValidationError::Attribute(other.to_string())),
        }
    }

    pub fn needs_humidifier(&self) -> bool {
        matches!(
            self,
            Command::HumidifierLevel(_) | Command::HumidifierStage(_)
        )
    }

    /// Short name used in logs and the wire capture.
    pub fn action(&self) -> &'static str {
        match self {
            Command::Power(_) => "set_power",
            Command::FanSpeed(_) => "set_fan_speed",
            Command::Mode(_) => "set_mode",
            Command::TargetTemperature(_) => "set_target_temperature",
            Command::HumidifierLevel(_) | Command::HumidifierStage(_) => "set_humidifier",
        }
    }
}

/// Validate a command and build the JSON patch the cloud expects.
pub fn command_patch(command: &Command) -> Result<Value, ValidationError> {
    match *command {
        Command::Power(on) => Ok(protocol::set_power_data(on)),
        Command::FanSpeed(n) => {
            let speed = u8::try_from(n)
                .ok()
                .and_then(FanSpeed::new)
                .ok_or(ValidationError::FanSpeed(n))?;
            Ok(protocol::set_fan_speed_data(speed.get()))
        }
        Command::Mode(mode) => Ok(protocol::set_damper_data(mode.as_vendor_code())),
        Command::TargetTemperature(t) => {
            if !t.is_finite() || !(MIN_TARGET_CELSIUS..=MAX_TARGET_CELSIUS).contains(&t) {
                return Err(ValidationError::Temperature(t));
            }
            let temp = Temperature::from_celsius(t);
            Ok(protocol::set_target_temperature_data(temp.to_deci_celsius()))
        }
        Command::HumidifierLevel(p) => {
            if !p.is_finite() || !(0.0..=100.0).contains(&p) {
                return Err(ValidationError::HumidifierLevel(p));
            }
            let stage = quantize_humidifier(p);
            Ok(protocol::set_humidifier_data(stage.as_vendor_code()))
        }
        Command::HumidifierStage(stage) => {
            Ok(protocol::set_humidifier_data(stage.as_vendor_code()))
        }
    }
}
