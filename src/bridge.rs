use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::CloudClient;
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorStatus, PollOutcome, Snapshot};
use crate::dispatcher::Dispatcher;
use crate::entity::{self, EntitySet};
use crate::normalize::Command;
use crate::types::{DeviceId, DeviceState, Event};
use crate::Result;

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;
type SnapshotCallback = Box<dyn Fn(&Snapshot) + Send + Sync>;

pub struct BridgeBuilder {
    config: Config,
    event_callbacks: Vec<EventCallback>,
    snapshot_callbacks: Vec<SnapshotCallback>,
}

impl BridgeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            event_callbacks: Vec::new(),
            snapshot_callbacks: Vec::new(),
        }
    }

    pub fn on_event(mut self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.event_callbacks.push(Box::new(f));
        self
    }

    pub fn on_snapshot(mut self, f: impl Fn(&Snapshot) + Send + Sync + 'static) -> Self {
        self.snapshot_callbacks.push(Box::new(f));
        self
    }

    /// Sign in, run the first poll, then keep polling in the background.
    ///
    /// Bad credentials fail with `Error::Auth`. Any other failure of the
    /// first poll is returned as-is; the bridge is not ready and the host
    /// may try again later.
    pub async fn start(self) -> Result<Bridge> {
        let config = self.config;
        config.validate()?;

        let mut client = CloudClient::builder()
            .base_url(config.base_url.as_str())
            .timeout(config.request_timeout);
        if let Some((mode, path)) = &config.message_log {
            client = client.message_log(*mode, path.clone());
        }
        let client = Arc::new(client.build()?);

        let mut coordinator = Coordinator::builder(Arc::clone(&client))
            .poll_interval(config.poll_interval)
            .offline_after_failures(config.offline_after_failures)
            .backoff(config.backoff_initial, config.backoff_max)
            .max_concurrent_fetches(config.max_concurrent_fetches);
        for cb in self.event_callbacks {
            coordinator = coordinator.on_event(cb);
        }
        for cb in self.snapshot_callbacks {
            coordinator = coordinator.on_snapshot(cb);
        }
        let coordinator = coordinator.build();

        if let Err(e) = client.authenticate(&config.email, config.password).await {
            client.close();
            return Err(e);
        }

        match coordinator.refresh().await {
            Ok(PollOutcome::Completed { devices, failed }) => {
                info!(devices, failed, "first poll complete");
            }
            Ok(PollOutcome::Skipped) => {}
            Err(e) => {
                warn!(error = %e, "first poll failed, bridge not ready");
                client.close();
                return Err(e);
            }
        }

        let task = coordinator.spawn();
        let dispatcher = Dispatcher::new(Arc::clone(&client), coordinator.clone());

        Ok(Bridge {
            client,
            coordinator,
            dispatcher,
            task: Some(task),
        })
    }
}

/// A running connection between the cloud account and the host.
///
/// Dropping the bridge stops polling and closes the client; `shutdown`
/// does the same and also waits for the polling task to finish.
pub struct Bridge {
    client: Arc<CloudClient>,
    coordinator: Coordinator,
    dispatcher: Dispatcher,
    task: Option<JoinHandle<()>>,
}

impl Bridge {
    pub fn builder(config: Config) -> BridgeBuilder {
        BridgeBuilder::new(config)
    }

    pub async fn start(config: Config) -> Result<Self> {
        BridgeBuilder::new(config).start().await
    }

    pub fn get_snapshot(&self, device_id: &DeviceId) -> Option<DeviceState> {
        self.coordinator.get_snapshot(device_id)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.coordinator.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.coordinator.subscribe()
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.coordinator.status()
    }

    pub fn entities(&self) -> EntitySet {
        entity::entities(&self.snapshot())
    }

    pub async fn submit_command(
        &self,
        device_id: &DeviceId,
        attribute: &str,
        value: &Value,
    ) -> Result<()> {
        self.dispatcher
            .submit_attribute(device_id, attribute, value)
            .await
    }

    pub async fn submit(&self, device_id: &DeviceId, command: Command) -> Result<()> {
        self.dispatcher.submit(device_id, command).await
    }

    /// Poll now instead of waiting for the next tick.
    pub async fn refresh(&self) -> Result<PollOutcome> {
        self.coordinator.refresh().await
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn client(&self) -> &Arc<CloudClient> {
        &self.client
    }

    pub async fn shutdown(mut self) {
        self.coordinator.shutdown();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "polling task ended abnormally");
        }
        self.client.close();
        info!("bridge stopped");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.coordinator.shutdown();
        self.client.close();
    }
}
