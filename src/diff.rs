use serde_json::{Map, Value};

use crate::types::{Device, DeviceId, DeviceState, Event};

/// One changed leaf between two JSON documents, addressed by dotted path.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    pub path: String,
    pub old: Value,
    pub new: Value,
}

pub(crate) fn diff_json(previous: &Value, current: &Value) -> Vec<Change> {
    let mut changes = Vec::new();
    walk(previous, current, "", &mut changes);
    changes
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn walk(previous: &Value, current: &Value, prefix: &str, changes: &mut Vec<Change>) {
    match (previous, current) {
        (Value::Object(prev), Value::Object(curr)) => {
            let empty = Value::Object(Map::new());
            for (key, curr_val) in curr {
                let path = join(prefix, key);
                match prev.get(key) {
                    Some(prev_val) => walk(prev_val, curr_val, &path, changes),
                    None if curr_val.is_object() => walk(&empty, curr_val, &path, changes),
                    None => changes.push(Change {
                        path,
                        old: Value::Null,
                        new: curr_val.clone(),
                    }),
                }
            }
            for (key, prev_val) in prev {
                if !curr.contains_key(key) {
                    changes.push(Change {
                        path: join(prefix, key),
                        old: prev_val.clone(),
                        new: Value::Null,
                    });
                }
            }
        }
        (prev, curr) if prev != curr => changes.push(Change {
            path: prefix.to_string(),
            old: prev.clone(),
            new: curr.clone(),
        }),
        _ => {}
    }
}

/// Events describing how a device's published state moved.
/// With no previous state every attribute is reported.
pub(crate) fn state_events(
    device_id: &DeviceId,
    previous: Option<&DeviceState>,
    next: &DeviceState,
) -> Vec<Event> {
    let mut events = Vec::new();
    let id = || device_id.clone();

    if previous.is_none_or(|p| p.online != next.online) {
        events.push(Event::OnlineChanged {
            device_id: id(),
            online: next.online,
        });
    }
    if previous.is_none_or(|p| p.power != next.power) {
        events.push(Event::PowerChanged {
            device_id: id(),
            on: next.power,
        });
    }
    if previous.is_none_or(|p| p.fan_speed != next.fan_speed) {
        events.push(Event::FanSpeedChanged {
            device_id: id(),
            speed: next.fan_speed,
        });
    }
    if previous.is_none_or(|p| p.mode != next.mode) {
        events.push(Event::ModeChanged {
            device_id: id(),
            mode: next.mode,
        });
    }
    if previous.is_none_or(|p| p.target_temperature != next.target_temperature) {
        events.push(Event::TargetTemperatureChanged {
            device_id: id(),
            temp: next.target_temperature,
        });
    }
    if previous.is_none_or(|p| p.current_temperature != next.current_temperature) {
        events.push(Event::TemperatureChanged {
            device_id: id(),
            temp: next.current_temperature,
        });
    }
    if previous.is_none_or(|p| p.current_humidity != next.current_humidity) {
        events.push(Event::HumidityChanged {
            device_id: id(),
            humidity: next.current_humidity,
        });
    }
    if previous.is_none_or(|p| p.humidifier != next.humidifier) {
        events.push(Event::HumidifierChanged {
            device_id: id(),
            stage: next.humidifier,
        });
    }

    events
}

/// Added and removed devices between two listings.
pub(crate) fn discovery_events<'a>(
    known: impl Iterator<Item = &'a DeviceId>,
    listed: &[Device],
) -> Vec<Event> {
    let known: Vec<&DeviceId> = known.collect();
    let mut events: Vec<Event> = listed
        .iter()
        .filter(|d| !known.contains(&&d.id))
        .map(|d| Event::DeviceAdded {
            device_id: d.id.clone(),
            name: d.name.clone(),
        })
        .collect();
    events.extend(
        known
            .into_iter()
            .filter(|id| !listed.iter().any(|d| &d.id == *id))
            .map(|id| Event::DeviceRemoved {
                device_id: id.clone(),
            }),
    );
    events
}
