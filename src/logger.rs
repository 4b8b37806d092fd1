use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

use crate::diff::diff_json;
use crate::types::DeviceId;

/// How state responses are written to the wire capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    Full,
    /// First response per device in full, then changed paths only.
    Diffed,
}

impl FromStr for MessageLogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(MessageLogMode::Full),
            "diffed" | "diff" => Ok(MessageLogMode::Diffed),
            other => Err(format!("unknown message log mode: {other}")),
        }
    }
}

/// NDJSON capture of traffic with the cloud API.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
    // Last body seen per device, diffed mode only.
    baselines: HashMap<DeviceId, Value>,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            baselines: HashMap::new(),
        })
    }

    pub fn log_request(&mut self, method: &str, path: &str, body: Option<&Value>) {
        self.emit("req", json!({ "method": method, "path": path, "body": body }));
    }

    /// A state patch sent to one device.
    pub fn log_command(&mut self, device_id: &DeviceId, patch: &Value) {
        self.emit("cmd", json!({ "device": device_id, "patch": patch }));
    }

    pub fn log_failure(&mut self, path: &str, status: Option<u16>, error: &str) {
        self.emit("err", json!({ "path": path, "status": status, "error": error }));
    }

    pub fn log_state(&mut self, device_id: &DeviceId, status: u16, body: &Value) {
        let mut fields = json!({ "device": device_id, "status": status });
        let previous = match self.mode {
            MessageLogMode::Full => None,
            MessageLogMode::Diffed => self.baselines.insert(device_id.clone(), body.clone()),
        };

        match (self.mode, previous) {
            (MessageLogMode::Diffed, Some(previous)) => {
                let changes = diff_json(&previous, body)
                    .into_iter()
                    .map(|c| json!({ "path": c.path, "old": c.old, "new": c.new }))
                    .collect::<Vec<_>>();
                fields["changes"] = Value::Array(changes);
            }
            (mode, _) => {
                if mode == MessageLogMode::Diffed {
                    fields["full"] = Value::Bool(true);
                }
                fields["body"] = body.clone();
            }
        }
        self.emit("state", fields);
    }

    /// Drop the diff baseline of a device that is no longer listed.
    pub fn forget_device(&mut self, device_id: &DeviceId) {
        self.baselines.remove(device_id);
    }

    /// Stamp `fields` with time and direction and append it as one line.
    fn emit(&mut self, dir: &str, mut fields: Value) {
        fields["ts"] = Value::String(Utc::now().to_rfc3339());
        fields["dir"] = Value::String(dir.to_string());

        let written = serde_json::to_string(&fields)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(self.file, "{line}"));
        if let Err(e) = written {
            warn!(error = %e, dir, "wire capture write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn capture(mode: MessageLogMode) -> (NamedTempFile, MessageLogger) {
        let tmp = NamedTempFile::new().unwrap();
        let logger = MessageLogger::new(mode, tmp.path()).unwrap();
        (tmp, logger)
    }

    fn entries(tmp: &NamedTempFile) -> Vec<Value> {
        let text = std::fs::read_to_string(tmp.path()).unwrap();
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[test]
    fn request_entry_is_one_json_line() {
        let (tmp, mut logger) = capture(MessageLogMode::Full);
        logger.log_request("GET", "/devices", None);

        let lines = entries(&tmp);
        assert_eq!(lines[0]["dir"], "req");
        assert_eq!(lines[0]["method"], "GET");
        assert!(lines[0]["ts"].as_str().is_some());
    }

    #[test]
    fn diffed_mode_tracks_each_device_separately() {
        let (tmp, mut logger) = capture(MessageLogMode::Diffed);
        let a = DeviceId::from(1u64);
        let b = DeviceId::from(2u64);

        logger.log_state(&a, 200, &json!({"condition": {"temp_in": 200}}));
        logger.log_state(&b, 200, &json!({"condition": {"temp_in": 180}}));
        logger.log_state(&a, 200, &json!({"condition": {"temp_in": 205}}));

        let lines = entries(&tmp);
        assert_eq!(lines[0]["full"], true);
        assert_eq!(lines[1]["full"], true);
        assert_eq!(lines[1]["device"], "2");
        let changes = lines[2]["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["path"], "condition.temp_in");
        assert_eq!(changes[0]["new"], 205);
    }

    #[test]
    fn repeated_state_logs_no_changes() {
        let (tmp, mut logger) = capture(MessageLogMode::Diffed);
        let id = DeviceId::from(1u64);
        let body = json!({"settings": {"u_pwr_on": true}});
        logger.log_state(&id, 200, &body);
        logger.log_state(&id, 200, &body);

        let lines = entries(&tmp);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["changes"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn forgotten_device_is_logged_in_full_again() {
        let (tmp, mut logger) = capture(MessageLogMode::Diffed);
        let id = DeviceId::from(9u64);
        let body = json!({"online": true});
        logger.log_state(&id, 200, &body);
        logger.forget_device(&id);
        logger.log_state(&id, 200, &body);

        let lines = entries(&tmp);
        assert_eq!(lines[1]["full"], true);
        assert_eq!(lines[1]["body"]["online"], true);
        assert!(logger.baselines.contains_key(&id));
    }

    #[test]
    fn command_entry_names_device() {
        let (tmp, mut logger) = capture(MessageLogMode::Diffed);
        logger.log_command(&DeviceId::from(4u64), &json!({"u_fan_speed": 2}));

        let lines = entries(&tmp);
        assert_eq!(lines[0]["dir"], "cmd");
        assert_eq!(lines[0]["device"], "4");
        assert_eq!(lines[0]["patch"]["u_fan_speed"], 2);
    }

    #[test]
    fn log_failure_records_status() {
        let (tmp, mut logger) = capture(MessageLogMode::Full);
        logger.log_failure("/devices/1/state", Some(503), "HTTP 503: busy");

        let lines = entries(&tmp);
        assert_eq!(lines[0]["dir"], "err");
        assert_eq!(lines[0]["status"], 503);
    }

    #[test]
    fn mode_parses_from_str() {
        assert_eq!("full".parse::<MessageLogMode>(), Ok(MessageLogMode::Full));
        assert_eq!("Diffed".parse::<MessageLogMode>(), Ok(MessageLogMode::Diffed));
        assert!("verbose".parse::<MessageLogMode>().is_err());
    }
}
