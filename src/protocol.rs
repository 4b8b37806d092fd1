use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::types::{Capabilities, Device, DeviceId};

pub const DEFAULT_BASE_URL: &str = "https://api.iot.atmeex.com";

pub const AUTH_PATH: &str = "/auth";
pub const DEVICES_PATH: &str = "/devices";

// Writable settings, also echoed back under "settings".
pub const FIELD_POWER: &str = "u_pwr_on";
pub const FIELD_FAN_SPEED: &str = "u_fan_speed";
pub const FIELD_DAMPER: &str = "u_damp_pos";
pub const FIELD_TARGET_TEMP: &str = "u_temp_room";
pub const FIELD_HUMIDIFIER: &str = "u_hum_stg";

// Live readings under "condition".
pub const COND_POWER: &str = "pwr_on";
pub const COND_FAN_SPEED: &str = "fan_speed";
pub const COND_DAMPER: &str = "damp_pos";
pub const COND_TEMP_IN: &str = "temp_in";
pub const COND_TARGET_TEMP: &str = "temp_room";
pub const COND_HUMIDITY: &str = "hum_room";
pub const COND_HUMIDIFIER: &str = "hum_stg";

/// Raw temperature value the cloud reports when a sensor has no reading.
pub const TEMPERATURE_SENTINEL: i64 = -100;

pub fn state_path(device_id: &DeviceId) -> String {
    format!("{DEVICES_PATH}/{device_id}/state")
}

pub fn auth_body(email: &str, password: &str) -> Value {
    json!({
        "email": email,
        "password": password,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AuthGrant {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub account: Option<String>,
}

pub(crate) fn parse_auth_response(body: &Value) -> Result<AuthGrant, ApiError> {
    let token = body
        .get("token")
        .or_else(|| body.get("access_token"))
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Decode {
            message: "auth response has no token".to_string(),
        })?;

    let expires_at = body
        .get("expiry")
        .and_then(|v| v.as_i64())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    let account = body
        .get("account")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(AuthGrant {
        token: token.to_string(),
        expires_at,
        account,
    })
}

/// Parse the device listing. Entries without an id are skipped.
pub(crate) fn parse_device_list(body: &Value) -> Result<Vec<Device>, ApiError> {
    let entries = match body {
        Value::Array(arr) => arr,
        Value::Object(obj) => match obj.get("devices") {
            Some(Value::Array(arr)) => arr,
            _ => {
                return Err(ApiError::Decode {
                    message: "device listing has no devices array".to_string(),
                });
            }
        },
        _ => {
            return Err(ApiError::Decode {
                message: "device listing is not an array".to_string(),
            });
        }
    };

    Ok(entries.iter().filter_map(parse_device).collect())
}

fn parse_device(entry: &Value) -> Option<Device> {
    let id = match entry.get("id")? {
        Value::Number(n) => DeviceId::from(n.as_u64()?),
        Value::String(s) if !s.is_empty() => DeviceId::from(s.as_str()),
        _ => return None,
    };

    let name = entry
        .get("name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Atmeex {id}"));

    let model = entry
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let humidifier = match entry.pointer("/capabilities/humidifier") {
        Some(v) => v.as_bool().unwrap_or(false),
        None => entry
            .pointer(&format!("/settings/{FIELD_HUMIDIFIER}"))
            .is_some_and(|v| !v.is_null()),
    };

    Some(Device {
        id,
        name,
        model,
        capabilities: Capabilities { humidifier },
    })
}

pub fn set_power_data(on: bool) -> Value {
    json!({ FIELD_POWER: on })
}

pub fn set_fan_speed_data(speed: u8) -> Value {
    json!({ FIELD_FAN_SPEED: speed })
}

pub fn set_damper_data(code: u8) -> Value {
    json!({ FIELD_DAMPER: code })
}

pub fn set_target_temperature_data(deci_celsius: i64) -> Value {
    json!({ FIELD_TARGET_TEMP: deci_celsius })
}

pub fn set_humidifier_data(stage: u8) -> Value {
    json!({ FIELD_HUMIDIFIER: stage })
}
