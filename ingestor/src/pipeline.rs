//! Ingestion pipeline: resolve the owner of a reading, then write it.
//!
//! The two remote calls run strictly in order. Once the owner is resolved
//! the write is always attempted, and the write is the only persisted side
//! effect, so a failure at either step leaves nothing to roll back.

use crate::errors::Error;
use crate::metrics::{
    INGEST_FAILURES_TOTAL, INGEST_LATENCY_SECONDS, READINGS_DROPPED_TOTAL, READINGS_TOTAL,
    READINGS_WRITTEN_TOTAL, STATUS_EVENTS_TOTAL,
};
use crate::model::{
    ConnectivityEvent, Device, DeviceStatusUpdate, IngestResponse, RawReading, TelemetryReading,
};
use crate::store::{DeviceStatusWriter, OwnerResolver, TelemetryWriter};
use crate::validate::{validate_event, validate_reading};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of one pipeline invocation.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The reading belongs to no registered device and was discarded.
    Dropped { device_id: String },
    Written(T),
    Failed(Error),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }
}

impl<T: Serialize> Outcome<T> {
    pub fn into_response(self) -> IngestResponse {
        match self {
            Outcome::Written(record) => match serde_json::to_value(&record) {
                Ok(body) => IngestResponse {
                    status_code: 200,
                    body,
                },
                Err(e) => failure_response(&Error::Json(e)),
            },
            Outcome::Dropped { .. } => IngestResponse {
                status_code: 200,
                body: Value::Null,
            },
            Outcome::Failed(err) => failure_response(&err),
        }
    }
}

fn failure_response(err: &Error) -> IngestResponse {
    IngestResponse {
        status_code: 400,
        body: json!({ "errors": err.entries() }),
    }
}

#[derive(Clone)]
pub struct Pipeline {
    resolver: Arc<dyn OwnerResolver>,
    writer: Arc<dyn TelemetryWriter>,
    devices: Arc<dyn DeviceStatusWriter>,
}

impl Pipeline {
    pub fn new(
        resolver: Arc<dyn OwnerResolver>,
        writer: Arc<dyn TelemetryWriter>,
        devices: Arc<dyn DeviceStatusWriter>,
    ) -> Self {
        Self {
            resolver,
            writer,
            devices,
        }
    }

    /// Turns a raw reading into a stored reading attributed to the device owner.
    pub async fn ingest_telemetry(&self, raw: RawReading) -> Outcome<TelemetryReading> {
        READINGS_TOTAL.inc();
        let start = Instant::now();

        let outcome = self.resolve_and_write(raw).await;

        match &outcome {
            Outcome::Written(reading) => {
                READINGS_WRITTEN_TOTAL.inc();
                INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                debug!(
                    "Stored reading {}@{} for owner {}",
                    reading.device_id, reading.timestamp, reading.owner
                );
            }
            Outcome::Dropped { device_id } => {
                READINGS_DROPPED_TOTAL.inc();
                info!("Dropping reading from unregistered device {}", device_id);
            }
            Outcome::Failed(e) => {
                INGEST_FAILURES_TOTAL.inc();
                error!("Telemetry ingestion failed: {}", e);
            }
        }

        outcome
    }

    async fn resolve_and_write(&self, raw: RawReading) -> Outcome<TelemetryReading> {
        if let Err(e) = validate_reading(&raw) {
            return Outcome::Failed(e);
        }

        let owner = match self.resolver.resolve_owner(&raw.device_id).await {
            Ok(owner) => owner,
            Err(Error::DeviceNotFound(device_id)) => return Outcome::Dropped { device_id },
            Err(e) => return Outcome::Failed(e),
        };

        let reading = raw.attribute(owner);
        match self.writer.write_telemetry(&reading).await {
            Ok(stored) => Outcome::Written(stored),
            Err(e) => Outcome::Failed(e),
        }
    }

    /// Applies a connectivity event as a single device status mutation.
    pub async fn ingest_status(&self, event: ConnectivityEvent) -> Outcome<Device> {
        STATUS_EVENTS_TOTAL.inc();

        let status = match validate_event(&event) {
            Ok(status) => status,
            Err(e) => {
                INGEST_FAILURES_TOTAL.inc();
                warn!("Rejecting connectivity event for {:?}: {}", event.device_id, e);
                return Outcome::Failed(e);
            }
        };

        let update = DeviceStatusUpdate {
            device_id: event.device_id,
            status,
            owner: None,
        };

        match self.devices.update_status(&update).await {
            Ok(device) => {
                info!("Device {} reported {}", device.device_id, device.status);
                Outcome::Written(device)
            }
            Err(e) => {
                INGEST_FAILURES_TOTAL.inc();
                error!("Status update for {} failed: {}", update.device_id, e);
                Outcome::Failed(e)
            }
        }
    }
}
