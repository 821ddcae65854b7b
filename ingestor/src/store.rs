//! Seams to the external device registry and telemetry store.
//!
//! Every backend (GraphQL API, Postgres, in-memory) implements the same set of
//! traits so the pipeline and the liveness monitor never know which one they
//! are talking to.

use crate::errors::Result;
use crate::model::{Device, DeviceStatusUpdate, Snapshot, TelemetryReading};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait OwnerResolver: Send + Sync {
    /// Returns the owner of `device_id`, or `Error::DeviceNotFound`.
    async fn resolve_owner(&self, device_id: &str) -> Result<String>;
}

#[async_trait]
pub trait TelemetryWriter: Send + Sync {
    /// Persists a fully attributed reading and returns the stored record.
    async fn write_telemetry(&self, reading: &TelemetryReading) -> Result<TelemetryReading>;
}

#[async_trait]
pub trait TelemetryReader: Send + Sync {
    async fn get_telemetry(
        &self,
        device_id: &str,
        timestamp: i64,
    ) -> Result<Option<TelemetryReading>>;
}

#[async_trait]
pub trait DeviceStatusWriter: Send + Sync {
    async fn update_status(&self, update: &DeviceStatusUpdate) -> Result<Device>;
}

/// Owner-facing registry management: device lifecycle and reading deletion.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Registers a device with no status. An existing `device_id` is rejected.
    async fn register_device(&self, device_id: &str, owner: &str) -> Result<Device>;

    /// Removes a device. Its stored readings stay, but new ones are dropped.
    async fn delete_device(&self, device_id: &str) -> Result<Option<Device>>;

    async fn delete_telemetry(
        &self,
        device_id: &str,
        timestamp: i64,
    ) -> Result<Option<TelemetryReading>>;
}

/// Current readable state of the store, polled by the liveness monitor.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Device>>;

    async fn list_telemetry(&self) -> Result<Vec<TelemetryReading>>;

    async fn snapshot(&self) -> Result<Snapshot> {
        let devices = self.list_devices().await?;
        let readings = self.list_telemetry().await?;
        Ok(Snapshot { devices, readings })
    }
}

/// A backend that serves every collaborator role.
pub trait Backend:
    OwnerResolver
    + TelemetryWriter
    + TelemetryReader
    + DeviceStatusWriter
    + DeviceRegistry
    + SnapshotSource
{
}

impl<T> Backend for T where
    T: OwnerResolver
        + TelemetryWriter
        + TelemetryReader
        + DeviceStatusWriter
        + DeviceRegistry
        + SnapshotSource
{
}

/// Shared handles to each role, cloned into every trigger.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn OwnerResolver>,
    pub writer: Arc<dyn TelemetryWriter>,
    pub reader: Arc<dyn TelemetryReader>,
    pub devices: Arc<dyn DeviceStatusWriter>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub source: Arc<dyn SnapshotSource>,
}

impl Collaborators {
    pub fn from_backend<B: Backend + 'static>(backend: Arc<B>) -> Self {
        Self {
            resolver: backend.clone(),
            writer: backend.clone(),
            reader: backend.clone(),
            devices: backend.clone(),
            registry: backend.clone(),
            source: backend,
        }
    }
}
