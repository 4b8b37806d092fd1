use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::CloudClient;
use crate::coordinator::Coordinator;
use crate::error::ValidationError;
use crate::normalize::{Command, command_patch};
use crate::types::DeviceId;
use crate::Result;

/// Turns host commands into vendor patches.
///
/// Commands to one device run one at a time; different devices proceed
/// independently and may overlap a poll cycle.
pub struct Dispatcher {
    client: Arc<CloudClient>,
    coordinator: Coordinator,
    device_locks: Mutex<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(client: Arc<CloudClient>, coordinator: Coordinator) -> Self {
        Self {
            client,
            coordinator,
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Parse the host's `(attribute, value)` pair and submit it.
    pub async fn submit_attribute(
        &self,
        device_id: &DeviceId,
        attribute: &str,
        value: &Value,
    ) -> Result<()> {
        let command = Command::parse(attribute, value)?;
        self.submit(device_id, command).await
    }

    /// Validate, send, then refresh the device so the next snapshot read
    /// reflects the change. A failed refresh does not fail the command.
    pub async fn submit(&self, device_id: &DeviceId, command: Command) -> Result<()> {
        let device = self
            .coordinator
            .device(device_id)
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.clone()))?;
        if command.needs_humidifier() && !device.has_humidifier() {
            return Err(ValidationError::NoHumidifier(device_id.clone()).into());
        }
        let patch = command_patch(&command)?;

        let device_lock = self.device_lock(device_id);
        let _guard = device_lock.lock().await;

        debug!(device_id = %device_id, action = command.action(), "dispatching command");
        self.client.send_command(device_id, &patch).await?;
        info!(device_id = %device_id, action = command.action(), "command accepted");

        if let Err(e) = self.coordinator.refresh_device(device_id).await {
            warn!(device_id = %device_id, error = %e, "refresh after command failed");
        }
        Ok(())
    }

    fn device_lock(&self, device_id: &DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .device_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(device_id.clone()).or_default())
    }
}
