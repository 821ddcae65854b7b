use crate::errors::{Error, Result};
use crate::model::{Device, DeviceStatus, DeviceStatusUpdate, TelemetryReading};
use crate::store::{
    DeviceRegistry, DeviceStatusWriter, OwnerResolver, SnapshotSource, TelemetryReader,
    TelemetryWriter,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Process-local registry and telemetry store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<BTreeMap<String, Device>>,
    telemetry: RwLock<BTreeMap<(String, i64), TelemetryReading>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a device, for startup seeding and tests.
    pub async fn seed_device(&self, device_id: &str, owner: &str) -> Device {
        let device = new_device(device_id, owner);
        self.devices
            .write()
            .await
            .insert(device_id.to_string(), device.clone());
        device
    }

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn telemetry_count(&self) -> usize {
        self.telemetry.read().await.len()
    }
}

#[async_trait]
impl OwnerResolver for MemoryStore {
    async fn resolve_owner(&self, device_id: &str) -> Result<String> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|device| device.owner.clone())
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
    }
}

#[async_trait]
impl TelemetryWriter for MemoryStore {
    async fn write_telemetry(&self, reading: &TelemetryReading) -> Result<TelemetryReading> {
        let key = (reading.device_id.clone(), reading.timestamp);
        let mut telemetry = self.telemetry.write().await;

        if telemetry.contains_key(&key) {
            return Err(Error::rejected(
                None,
                format!(
                    "Reading for {} at {} already exists",
                    reading.device_id, reading.timestamp
                ),
            ));
        }

        telemetry.insert(key, reading.clone());
        debug!("Stored reading {}@{}", reading.device_id, reading.timestamp);
        Ok(reading.clone())
    }
}

#[async_trait]
impl TelemetryReader for MemoryStore {
    async fn get_telemetry(
        &self,
        device_id: &str,
        timestamp: i64,
    ) -> Result<Option<TelemetryReading>> {
        Ok(self
            .telemetry
            .read()
            .await
            .get(&(device_id.to_string(), timestamp))
            .cloned())
    }
}

#[async_trait]
impl DeviceStatusWriter for MemoryStore {
    async fn update_status(&self, update: &DeviceStatusUpdate) -> Result<Device> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(&update.device_id).ok_or_else(|| {
            Error::rejected(None, format!("Device {} does not exist", update.device_id))
        })?;

        device.status = update.status;
        Ok(device.clone())
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn register_device(&self, device_id: &str, owner: &str) -> Result<Device> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(device_id) {
            return Err(Error::rejected(
                None,
                format!("Device {} already exists", device_id),
            ));
        }

        let device = new_device(device_id, owner);
        devices.insert(device_id.to_string(), device.clone());
        Ok(device)
    }

    async fn delete_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.devices.write().await.remove(device_id))
    }

    async fn delete_telemetry(
        &self,
        device_id: &str,
        timestamp: i64,
    ) -> Result<Option<TelemetryReading>> {
        Ok(self
            .telemetry
            .write()
            .await
            .remove(&(device_id.to_string(), timestamp)))
    }
}

fn new_device(device_id: &str, owner: &str) -> Device {
    Device {
        device_id: device_id.to_string(),
        owner: owner.to_string(),
        status: DeviceStatus::Unknown,
    }
}

#[async_trait]
impl SnapshotSource for MemoryStore {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.read().await.values().cloned().collect())
    }

    async fn list_telemetry(&self) -> Result<Vec<TelemetryReading>> {
        Ok(self.telemetry.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(timestamp: i64) -> TelemetryReading {
        TelemetryReading {
            device_id: "d1".to_string(),
            timestamp,
            temperature: Some(21.0),
            humidity: None,
            owner: "u1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_timestamp_is_rejected() {
        let store = MemoryStore::new();

        store.write_telemetry(&reading(1000)).await.unwrap();
        let err = store.write_telemetry(&reading(1000)).await.unwrap_err();

        assert!(matches!(err, Error::WriteRejected { .. }));
        assert_eq!(store.telemetry_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_device_lookup() {
        let store = MemoryStore::new();

        let err = store.resolve_owner("ghost").await.unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_status_update_requires_device() {
        let store = MemoryStore::new();
        let update = DeviceStatusUpdate {
            device_id: "d1".to_string(),
            status: DeviceStatus::Online,
            owner: None,
        };

        assert!(store.update_status(&update).await.is_err());

        store.seed_device("d1", "u1").await;
        let device = store.update_status(&update).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.owner, "u1");
    }

    #[tokio::test]
    async fn test_register_rejects_existing_device() {
        let store = MemoryStore::new();

        let device = store.register_device("d1", "u1").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Unknown);

        let err = store.register_device("d1", "u2").await.unwrap_err();
        assert!(matches!(err, Error::WriteRejected { .. }));
        assert_eq!(store.resolve_owner("d1").await.unwrap(), "u1");
    }

    #[tokio::test]
    async fn test_deleted_device_no_longer_resolves() {
        let store = MemoryStore::new();
        store.seed_device("d1", "u1").await;
        store.write_telemetry(&reading(1000)).await.unwrap();

        assert!(store.delete_device("d1").await.unwrap().is_some());
        assert!(store.delete_device("d1").await.unwrap().is_none());
        assert!(matches!(
            store.resolve_owner("d1").await,
            Err(Error::DeviceNotFound(_))
        ));
        assert_eq!(store.telemetry_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_telemetry() {
        let store = MemoryStore::new();
        store.write_telemetry(&reading(1000)).await.unwrap();

        let removed = store.delete_telemetry("d1", 1000).await.unwrap();
        assert_eq!(removed, Some(reading(1000)));
        assert_eq!(store.get_telemetry("d1", 1000).await.unwrap(), None);
        assert_eq!(store.delete_telemetry("d1", 1000).await.unwrap(), None);
    }
}
