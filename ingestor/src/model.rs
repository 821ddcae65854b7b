use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Stored telemetry reading, keyed by `(device_id, timestamp)`.
///
/// `owner` is copied from the device at ingestion time and never re-derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetryReading {
    pub device_id: String,
    /// Sensor clock, epoch milliseconds
    pub timestamp: i64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub owner: String,
}

/// Telemetry as published by a device, before ownership is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub device_id: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    pub timestamp: i64,
}

impl RawReading {
    pub fn attribute(self, owner: String) -> TelemetryReading {
        TelemetryReading {
            device_id: self.device_id,
            timestamp: self.timestamp,
            temperature: self.temperature,
            humidity: self.humidity,
            owner,
        }
    }
}

/// Device lifecycle event (connect/disconnect) from the device gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    pub device_id: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
}

impl ConnectivityEvent {
    pub fn status(&self) -> Option<DeviceStatus> {
        DeviceStatus::from_event_type(&self.event_type)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    #[default]
    #[serde(other)]
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "connected" | "online" => Some(DeviceStatus::Online),
            "disconnected" | "offline" => Some(DeviceStatus::Offline),
            _ => None,
        }
    }

    /// Maps a stored status column. Anything unrecognised reads as unknown.
    pub fn from_stored(value: Option<&str>) -> Self {
        match value {
            Some("online") => DeviceStatus::Online,
            Some("offline") => DeviceStatus::Offline,
            _ => DeviceStatus::Unknown,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn status_or_unknown<'de, D>(deserializer: D) -> Result<DeviceStatus, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<DeviceStatus>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub owner: String,
    #[serde(default, deserialize_with = "status_or_unknown")]
    pub status: DeviceStatus,
}

/// Body of a device registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub owner: String,
}

/// Payload of the device status mutation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusUpdate {
    pub device_id: String,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Inferred status change produced by the liveness monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub device_id: String,
    pub status: DeviceStatus,
    pub source_timestamp: i64,
    pub owner: String,
}

impl StatusEvent {
    pub fn to_update(&self) -> DeviceStatusUpdate {
        DeviceStatusUpdate {
            device_id: self.device_id.clone(),
            status: self.status,
            owner: Some(self.owner.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: u64,
    /// Owner of the device the alert is about
    pub owner: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Dashboard read model: a device with its most recent reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub owner: String,
    pub status: DeviceStatus,
    pub last_seen: Option<i64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

/// Everything visible to the current identity at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub devices: Vec<Device>,
    pub readings: Vec<TelemetryReading>,
}

/// One entry of a failed response's error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub error: String,
}

/// Gateway-style answer to an ingestion trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}
