//! Liveness monitor.
//!
//! On every tick the monitor pulls a fresh snapshot of devices and readings,
//! works out which devices went stale, and issues a status mutation only for
//! devices whose stored status disagrees with what their readings imply.
//! Offline transitions are announced through an in-process notification log.
//!
//! All monitor state is owned by the task running [`LivenessMonitor::run`].
//! Other tasks observe it through [`MonitorHandle`], which hands out
//! `watch` snapshots and forwards dismissals to the monitor task.

use crate::errors::{Error, Result};
use crate::metrics::{
    ACTIVE_NOTIFICATIONS, MONITOR_TICK_SECONDS, OFFLINE_TRANSITIONS_TOTAL,
    STATUS_MUTATIONS_TOTAL, STATUS_MUTATION_FAILURES_TOTAL,
};
use crate::model::{
    Device, DeviceStatus, DeviceSummary, Notification, Snapshot, StatusEvent, TelemetryReading,
};
use crate::store::{DeviceStatusWriter, SnapshotSource};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 64;
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Most recent reading per device, by largest timestamp.
pub fn latest_readings(readings: &[TelemetryReading]) -> HashMap<&str, &TelemetryReading> {
    let mut latest: HashMap<&str, &TelemetryReading> = HashMap::new();
    for reading in readings {
        latest
            .entry(reading.device_id.as_str())
            .and_modify(|current| {
                if reading.timestamp > current.timestamp {
                    *current = reading;
                }
            })
            .or_insert(reading);
    }
    latest
}

/// Status changes implied by `snapshot` at time `now` (epoch millis).
///
/// Devices without readings are left alone: no data is not evidence of
/// being offline. A device exactly `stale_threshold` old is still online.
pub fn evaluate(snapshot: &Snapshot, now: i64, stale_threshold: i64) -> Vec<StatusEvent> {
    let latest = latest_readings(&snapshot.readings);

    snapshot
        .devices
        .iter()
        .filter_map(|device| {
            let reading = latest.get(device.device_id.as_str())?;
            let target = if now.saturating_sub(reading.timestamp) > stale_threshold {
                DeviceStatus::Offline
            } else {
                DeviceStatus::Online
            };

            (target != device.status).then(|| StatusEvent {
                device_id: device.device_id.clone(),
                status: target,
                source_timestamp: reading.timestamp,
                owner: device.owner.clone(),
            })
        })
        .collect()
}

pub fn summarize(snapshot: &Snapshot) -> Vec<DeviceSummary> {
    let latest = latest_readings(&snapshot.readings);

    snapshot
        .devices
        .iter()
        .map(|device| {
            let reading = latest.get(device.device_id.as_str());
            DeviceSummary {
                device_id: device.device_id.clone(),
                owner: device.owner.clone(),
                status: device.status,
                last_seen: reading.map(|r| r.timestamp),
                temperature: reading.and_then(|r| r.temperature),
                humidity: reading.and_then(|r| r.humidity),
            }
        })
        .collect()
}

/// Session-scoped alert log. Entries stay until dismissed.
#[derive(Debug, Default)]
pub struct NotificationLog {
    next_id: u64,
    entries: Vec<Notification>,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, owner: &str, message: String, created_at: DateTime<Utc>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Notification {
            id,
            owner: owner.to_string(),
            message,
            created_at,
        });
        id
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|n| n.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[Notification] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    pub mutations: usize,
    pub failures: usize,
    pub offline: usize,
}

#[derive(Debug)]
enum Command {
    Dismiss { id: u64, reply: oneshot::Sender<bool> },
}

/// Read-only view of the monitor plus a way to dismiss notifications.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    notifications: watch::Receiver<Vec<Notification>>,
    devices: watch::Receiver<Vec<DeviceSummary>>,
    commands: mpsc::Sender<Command>,
}

impl MonitorHandle {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.borrow().clone()
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.devices.borrow().clone()
    }

    /// Asks the monitor task to drop a notification. Returns whether it existed.
    pub async fn dismiss(&self, id: u64) -> Result<bool> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Dismiss { id, reply })
            .await
            .map_err(|_| Error::ChannelSend)?;
        answer.await.map_err(|_| Error::ChannelSend)
    }
}

pub struct LivenessMonitor {
    source: Arc<dyn SnapshotSource>,
    devices: Arc<dyn DeviceStatusWriter>,
    stale_threshold: i64,
    snapshot: Snapshot,
    log: NotificationLog,
    notifications_tx: watch::Sender<Vec<Notification>>,
    devices_tx: watch::Sender<Vec<DeviceSummary>>,
    commands: mpsc::Receiver<Command>,
}

impl LivenessMonitor {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        devices: Arc<dyn DeviceStatusWriter>,
        stale_threshold: Duration,
    ) -> (Self, MonitorHandle) {
        let (notifications_tx, notifications) = watch::channel(Vec::new());
        let (devices_tx, device_view) = watch::channel(Vec::new());
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);

        let monitor = Self {
            source,
            devices,
            stale_threshold: i64::try_from(stale_threshold.as_millis()).unwrap_or(i64::MAX),
            snapshot: Snapshot::default(),
            log: NotificationLog::new(),
            notifications_tx,
            devices_tx,
            commands,
        };
        let handle = MonitorHandle {
            notifications,
            devices: device_view,
            commands: commands_tx,
        };

        (monitor, handle)
    }

    pub fn notifications(&self) -> &[Notification] {
        self.log.entries()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Runs one evaluation at `now` (epoch millis).
    ///
    /// Fails only when the snapshot cannot be refreshed, in which case nothing
    /// is evaluated. Mutation failures are counted in the report and left for
    /// the next tick to correct.
    pub async fn tick(&mut self, now: i64) -> Result<TickReport> {
        self.snapshot = self.source.snapshot().await?;

        let events = evaluate(&self.snapshot, now, self.stale_threshold);
        let mut report = TickReport {
            evaluated: self.snapshot.devices.len(),
            ..TickReport::default()
        };

        for event in events {
            match self.devices.update_status(&event.to_update()).await {
                Ok(device) => {
                    STATUS_MUTATIONS_TOTAL.inc();
                    report.mutations += 1;
                    info!(
                        "Device {} is now {} (last reading at {})",
                        event.device_id, event.status, event.source_timestamp
                    );
                    self.apply(device);

                    if event.status == DeviceStatus::Offline {
                        OFFLINE_TRANSITIONS_TOTAL.inc();
                        report.offline += 1;
                        self.log.push(
                            &event.owner,
                            format!("Device {} went offline.", event.device_id),
                            Utc::now(),
                        );
                    }
                }
                Err(e) => {
                    STATUS_MUTATION_FAILURES_TOTAL.inc();
                    report.failures += 1;
                    warn!(
                        "Failed to mark device {} {}: {}",
                        event.device_id, event.status, e
                    );
                }
            }
        }

        self.publish();
        Ok(report)
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        let found = self.log.dismiss(id);
        if found {
            debug!("Dismissed notification {}", id);
            self.publish();
        }
        found
    }

    fn apply(&mut self, updated: Device) {
        match self
            .snapshot
            .devices
            .iter_mut()
            .find(|d| d.device_id == updated.device_id)
        {
            Some(device) => *device = updated,
            None => self.snapshot.devices.push(updated),
        }
    }

    fn publish(&self) {
        ACTIVE_NOTIFICATIONS.set(self.log.len() as f64);
        self.notifications_tx.send_replace(self.log.entries().to_vec());
        self.devices_tx.send_replace(summarize(&self.snapshot));
    }

    /// Evaluates every `period` until the task is dropped.
    ///
    /// Ticks are awaited inline, so a slow tick delays (and with
    /// `MissedTickBehavior::Skip`, swallows) the next one instead of overlapping it.
    pub async fn run(mut self, period: Duration) {
        info!(
            "Starting liveness monitor with period={:?}, stale_threshold={}ms",
            period, self.stale_threshold
        );

        let mut ticker = interval(period.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    match self.tick(Utc::now().timestamp_millis()).await {
                        Ok(report) => debug!("Liveness tick: {:?}", report),
                        Err(e) => warn!("Skipping liveness tick, snapshot unavailable: {}", e),
                    }
                    MONITOR_TICK_SECONDS.observe(start.elapsed().as_secs_f64());
                }

                command = self.commands.recv(), if commands_open => {
                    match command {
                        Some(Command::Dismiss { id, reply }) => {
                            let found = self.dismiss(id);
                            let _ = reply.send(found);
                        }
                        None => {
                            debug!("All monitor handles dropped");
                            commands_open = false;
                        }
                    }
                }
            }
        }
    }
}
