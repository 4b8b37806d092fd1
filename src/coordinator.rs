use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::CloudClient;
use crate::diff::{discovery_events, state_events};
use crate::error::{NormalizationError, ValidationError};
use crate::normalize::normalize_state;
use crate::types::{Device, DeviceId, DeviceState, Event};
use crate::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_OFFLINE_AFTER_FAILURES: u32 = 3;
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;
type SnapshotCallback = Box<dyn Fn(&Snapshot) + Send + Sync>;

/// A listed device and its last good state, if any poll has produced one.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub device: Device,
    pub state: Option<DeviceState>,
}

/// Everything the coordinator knows, published as one immutable value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    devices: BTreeMap<DeviceId, DeviceSnapshot>,
    updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceSnapshot> {
        self.devices.get(id)
    }

    pub fn state(&self, id: &DeviceId) -> Option<&DeviceState> {
        self.devices.get(id).and_then(|d| d.state.as_ref())
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceSnapshot> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    BackingOff { retry_in: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStatus {
    pub state: PollState,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_cycle_failures: u32,
}

impl Default for CoordinatorStatus {
    fn default() -> Self {
        Self {
            state: PollState::Idle,
            last_success: None,
            last_error: None,
            consecutive_cycle_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { devices: usize, failed: usize },
    /// Another cycle was already running.
    Skipped,
}

/// Capped exponential delay between failed cycles.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

pub struct CoordinatorBuilder {
    client: Arc<CloudClient>,
    poll_interval: Duration,
    offline_after_failures: u32,
    backoff_initial: Duration,
    backoff_max: Duration,
    max_concurrent_fetches: usize,
    event_callbacks: Vec<EventCallback>,
    snapshot_callbacks: Vec<SnapshotCallback>,
}

impl CoordinatorBuilder {
    pub fn new(client: Arc<CloudClient>) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            offline_after_failures: DEFAULT_OFFLINE_AFTER_FAILURES,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            event_callbacks: Vec::new(),
            snapshot_callbacks: Vec::new(),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Consecutive failed fetches before a device is reported offline.
    pub fn offline_after_failures(mut self, failures: u32) -> Self {
        self.offline_after_failures = failures.max(1);
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    pub fn max_concurrent_fetches(mut self, n: usize) -> Self {
        self.max_concurrent_fetches = n.max(1);
        self
    }

    pub fn on_event(mut self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.event_callbacks.push(Box::new(f));
        self
    }

    pub fn on_snapshot(mut self, f: impl Fn(&Snapshot) + Send + Sync + 'static) -> Self {
        self.snapshot_callbacks.push(Box::new(f));
        self
    }

    pub fn build(self) -> Coordinator {
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::default()));
        let (status, _) = watch::channel(CoordinatorStatus::default());
        Coordinator {
            inner: Arc::new(Inner {
                client: self.client,
                poll_interval: self.poll_interval,
                offline_after_failures: self.offline_after_failures,
                max_concurrent_fetches: self.max_concurrent_fetches,
                snapshot,
                status,
                book: Mutex::new(Book::default()),
                backoff: Mutex::new(Backoff::new(self.backoff_initial, self.backoff_max)),
                poll_guard: tokio::sync::Mutex::new(()),
                sequence: AtomicU64::new(0),
                event_callbacks: self.event_callbacks,
                snapshot_callbacks: self.snapshot_callbacks,
                cancel: CancellationToken::new(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct Tracker {
    consecutive_failures: u32,
    /// Sequence number of the newest fetch applied to this device.
    last_seq: u64,
}

#[derive(Debug, Default)]
struct Book {
    trackers: HashMap<DeviceId, Tracker>,
}

struct Inner {
    client: Arc<CloudClient>,
    poll_interval: Duration,
    offline_after_failures: u32,
    max_concurrent_fetches: usize,
    snapshot: watch::Sender<Arc<Snapshot>>,
    status: watch::Sender<CoordinatorStatus>,
    // Writers hold this while building and publishing the next snapshot.
    book: Mutex<Book>,
    backoff: Mutex<Backoff>,
    poll_guard: tokio::sync::Mutex<()>,
    sequence: AtomicU64,
    event_callbacks: Vec<EventCallback>,
    snapshot_callbacks: Vec<SnapshotCallback>,
    cancel: CancellationToken,
}

/// Keeps the published snapshot current by polling the cloud.
///
/// Cheap to clone; clones share the same state. At most one poll cycle
/// runs at a time, and a fetch result never replaces one that was started
/// after it.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn builder(client: Arc<CloudClient>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(client)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.snapshot.borrow())
    }

    /// Last published state of one device. Never blocks on the network.
    pub fn get_snapshot(&self, device_id: &DeviceId) -> Option<DeviceState> {
        self.snapshot().state(device_id).cloned()
    }

    pub fn device(&self, device_id: &DeviceId) -> Option<Device> {
        self.snapshot().device(device_id).map(|d| d.device.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.inner.snapshot.subscribe()
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.inner.status.subscribe()
    }

    pub fn client(&self) -> &Arc<CloudClient> {
        &self.inner.client
    }

    /// Run one full poll cycle now, unless one is already in flight.
    pub async fn refresh(&self) -> Result<PollOutcome> {
        let Ok(_guard) = self.inner.poll_guard.try_lock() else {
            debug!("poll already in flight, skipping");
            return Ok(PollOutcome::Skipped);
        };

        self.set_poll_state(PollState::Polling);
        let result = self.poll_cycle().await;

        match &result {
            Ok(PollOutcome::Completed { devices, failed }) if *devices > 0 && failed == devices => {
                self.cycle_failed(format!("all {devices} device fetches failed"), true);
            }
            Ok(_) => self.cycle_succeeded(),
            Err(Error::Closed) => self.cycle_failed(Error::Closed.to_string(), true),
            Err(e) => {
                // No device was reached, so each one takes a failure.
                self.apply_outage();
                self.cycle_failed(e.to_string(), e.is_transient());
            }
        }
        result
    }

    /// Fetch and publish one device outside the regular cadence.
    pub async fn refresh_device(&self, device_id: &DeviceId) -> Result<()> {
        let device = self
            .device(device_id)
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.clone()))?;

        let seq = self.next_seq();
        let result = self.inner.client.fetch_state(device_id).await;

        let (events, snapshot, normalized) = {
            let mut book = lock(&self.inner.book);
            let mut next = (*self.snapshot()).clone();
            let mut events = Vec::new();
            let normalized = self.apply_fetch(
                &mut book,
                &mut next.devices,
                &device,
                seq,
                result.as_ref(),
                &mut events,
            );
            next.updated_at = Some(Utc::now());
            let snapshot = Arc::new(next);
            self.inner.snapshot.send_replace(Arc::clone(&snapshot));
            (events, snapshot, normalized)
        };
        self.notify(&events, &snapshot);

        result?;
        normalized?;
        Ok(())
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// Poll on the configured cadence until shut down. Failed cycles wait
    /// out the backoff delay instead of the regular interval.
    pub async fn run(&self) {
        let cancel = self.inner.cancel.clone();
        loop {
            let delay = match self.status().state {
                PollState::BackingOff { retry_in } => retry_in,
                _ => self.inner.poll_interval,
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.refresh() => {
                    if let Err(e) = result {
                        warn!(error = %e, "periodic refresh failed");
                    }
                }
            }
        }
        debug!("coordinator loop stopped");
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    // -- Cycle --

    async fn poll_cycle(&self) -> Result<PollOutcome> {
        let listed = self.inner.client.list_devices().await?;

        let fetched: Vec<(Device, u64, Result<Value>)> = stream::iter(listed.iter().cloned())
            .map(|device| async move {
                let seq = self.next_seq();
                let result = self.inner.client.fetch_state(&device.id).await;
                (device, seq, result)
            })
            .buffer_unordered(self.inner.max_concurrent_fetches)
            .collect()
            .await;

        if self.inner.client.is_closed() {
            return Err(Error::Closed);
        }

        let failed = fetched.iter().filter(|(_, _, r)| r.is_err()).count();
        self.apply_cycle(&listed, &fetched);

        debug!(devices = listed.len(), failed, "poll cycle complete");
        Ok(PollOutcome::Completed {
            devices: listed.len(),
            failed,
        })
    }

    fn apply_cycle(&self, listed: &[Device], fetched: &[(Device, u64, Result<Value>)]) {
        let (events, snapshot) = {
            let mut book = lock(&self.inner.book);
            let current = self.snapshot();
            let mut events = discovery_events(current.devices.keys(), listed);

            let mut devices = BTreeMap::new();
            for device in listed {
                let state = current.state(&device.id).cloned();
                devices.insert(
                    device.id.clone(),
                    DeviceSnapshot {
                        device: device.clone(),
                        state,
                    },
                );
            }
            book.trackers.retain(|id, _| devices.contains_key(id));
            for gone in current.devices.keys().filter(|id| !devices.contains_key(*id)) {
                self.inner.client.forget_device(gone);
            }

            for (device, seq, result) in fetched {
                // Logged inside; the device keeps its previous state.
                let _ = self.apply_fetch(
                    &mut book,
                    &mut devices,
                    device,
                    *seq,
                    result.as_ref(),
                    &mut events,
                );
            }

            let snapshot = Arc::new(Snapshot {
                devices,
                updated_at: Some(Utc::now()),
            });
            self.inner.snapshot.send_replace(Arc::clone(&snapshot));
            (events, snapshot)
        };
        self.notify(&events, &snapshot);
    }

    /// Fold one fetch result into `devices`. Results older than what was
    /// already applied are dropped.
    fn apply_fetch(
        &self,
        book: &mut Book,
        devices: &mut BTreeMap<DeviceId, DeviceSnapshot>,
        device: &Device,
        seq: u64,
        result: std::result::Result<&Value, &Error>,
        events: &mut Vec<Event>,
    ) -> std::result::Result<(), NormalizationError> {
        let Some(entry) = devices.get_mut(&device.id) else {
            return Ok(());
        };
        let tracker = book.trackers.entry(device.id.clone()).or_default();
        if seq <= tracker.last_seq {
            trace!(device_id = %device.id, seq, last = tracker.last_seq, "dropping stale fetch");
            return Ok(());
        }
        tracker.last_seq = seq;

        match result {
            Ok(raw) => match normalize_state(device, raw) {
                Ok(state) => {
                    tracker.consecutive_failures = 0;
                    events.extend(state_events(&device.id, entry.state.as_ref(), &state));
                    entry.state = Some(state);
                    Ok(())
                }
                Err(e) => {
                    warn!(device_id = %device.id, error = %e, "skipping malformed state");
                    Err(e)
                }
            },
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "state fetch failed");
                self.record_failure(tracker, entry, events);
                Ok(())
            }
        }
    }

    /// Count a failed poll against every known device after the device
    /// listing itself could not be fetched.
    fn apply_outage(&self) {
        let (events, snapshot) = {
            let mut book = lock(&self.inner.book);
            let mut next = (*self.snapshot()).clone();
            let mut events = Vec::new();
            for entry in next.devices.values_mut() {
                let tracker = book.trackers.entry(entry.device.id.clone()).or_default();
                self.record_failure(tracker, entry, &mut events);
            }
            if events.is_empty() {
                return;
            }
            let snapshot = Arc::new(next);
            self.inner.snapshot.send_replace(Arc::clone(&snapshot));
            (events, snapshot)
        };
        self.notify(&events, &snapshot);
    }

    /// Bump the failure count and flip `online` once the threshold is hit.
    /// A device that never reported keeps no state.
    fn record_failure(
        &self,
        tracker: &mut Tracker,
        entry: &mut DeviceSnapshot,
        events: &mut Vec<Event>,
    ) {
        tracker.consecutive_failures = tracker.consecutive_failures.saturating_add(1);
        trace!(
            device_id = %entry.device.id,
            failures = tracker.consecutive_failures,
            "failure recorded"
        );
        if tracker.consecutive_failures >= self.inner.offline_after_failures
            && let Some(state) = entry.state.as_mut()
            && state.online
        {
            info!(device_id = %entry.device.id, "marking device offline");
            state.online = false;
            events.push(Event::OnlineChanged {
                device_id: entry.device.id.clone(),
                online: false,
            });
        }
    }

    fn next_seq(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, events: &[Event], snapshot: &Snapshot) {
        for event in events {
            for cb in &self.inner.event_callbacks {
                cb(event);
            }
        }
        for cb in &self.inner.snapshot_callbacks {
            cb(snapshot);
        }
    }

    // -- Status --

    fn set_poll_state(&self, state: PollState) {
        self.inner.status.send_modify(|s| s.state = state);
    }

    fn cycle_succeeded(&self) {
        lock(&self.inner.backoff).reset();
        self.inner.status.send_modify(|s| {
            s.state = PollState::Idle;
            s.last_success = Some(Utc::now());
            s.last_error = None;
            s.consecutive_cycle_failures = 0;
        });
    }

    fn cycle_failed(&self, error: String, transient: bool) {
        let retry_in = lock(&self.inner.backoff).next_delay();
        let retry_in_secs = retry_in.as_secs();
        if transient {
            warn!(error = %error, retry_in_secs, "poll cycle failed, backing off");
        } else {
            error!(error = %error, retry_in_secs, "poll cycle failed, needs attention");
        }
        self.inner.status.send_modify(|s| {
            s.state = PollState::BackingOff { retry_in };
            s.last_error = Some(error);
            s.consecutive_cycle_failures = s.consecutive_cycle_failures.saturating_add(1);
        });
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
