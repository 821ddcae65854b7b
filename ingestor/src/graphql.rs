use crate::errors::{Error, Result};
use crate::model::{Device, DeviceStatusUpdate, TelemetryReading};
use crate::store::{
    DeviceRegistry, DeviceStatusWriter, OwnerResolver, SnapshotSource, TelemetryReader,
    TelemetryWriter,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

const PAGE_SIZE: u32 = 1000;

const GET_DEVICE_QUERY: &str = r#"
query GetDevice($device_id: String!) {
  getDevices(device_id: $device_id) { device_id owner status }
}"#;

const CREATE_TELEMETRY_MUTATION: &str = r#"
mutation CreateTelemetry($input: CreateTelemetryInput!) {
  createTelemetry(input: $input) { device_id timestamp temperature humidity owner }
}"#;

const GET_TELEMETRY_QUERY: &str = r#"
query GetTelemetry($device_id: String!, $timestamp: AWSTimestamp!) {
  getTelemetry(device_id: $device_id, timestamp: $timestamp) {
    device_id timestamp temperature humidity owner
  }
}"#;

const UPDATE_DEVICE_MUTATION: &str = r#"
mutation UpdateDeviceStatus($input: UpdateDevicesInput!) {
  updateDevices(input: $input) { device_id owner status }
}"#;

const CREATE_DEVICE_MUTATION: &str = r#"
mutation CreateDevice($input: CreateDevicesInput!) {
  createDevices(input: $input) { device_id owner status }
}"#;

const DELETE_DEVICE_MUTATION: &str = r#"
mutation DeleteDevice($input: DeleteDevicesInput!) {
  deleteDevices(input: $input) { device_id owner status }
}"#;

const DELETE_TELEMETRY_MUTATION: &str = r#"
mutation DeleteTelemetry($input: DeleteTelemetryInput!) {
  deleteTelemetry(input: $input) { device_id timestamp temperature humidity owner }
}"#;

const LIST_DEVICES_QUERY: &str = r#"
query ListDevices($limit: Int, $nextToken: String) {
  listDevices(limit: $limit, nextToken: $nextToken) {
    items { device_id owner status }
    nextToken
  }
}"#;

const LIST_TELEMETRY_QUERY: &str = r#"
query ListTelemetries($limit: Int, $nextToken: String) {
  listTelemetries(limit: $limit, nextToken: $nextToken) {
    items { device_id timestamp temperature humidity owner }
    nextToken
  }
}"#;

/// Which side of the pipeline a call belongs to; decides how failures map
/// onto the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Read,
    Write,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    items: Vec<T>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetDeviceData {
    get_devices: Option<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTelemetryData {
    create_telemetry: Option<TelemetryReading>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetTelemetryData {
    get_telemetry: Option<TelemetryReading>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDeviceData {
    update_devices: Option<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeviceData {
    create_devices: Option<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteDeviceData {
    delete_devices: Option<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteTelemetryData {
    delete_telemetry: Option<TelemetryReading>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDevicesData {
    list_devices: Page<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTelemetryData {
    list_telemetries: Page<TelemetryReading>,
}

/// Client for the device registry / telemetry GraphQL API.
///
/// Authenticates every call with the machine-to-machine API key.
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GraphqlClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        phase: Phase,
        query: &str,
        variables: Value,
    ) -> Result<Option<T>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| request_error(phase, e))?;

        let status = response.status();
        debug!("GraphQL endpoint replied with {}", status);

        if status.is_server_error() {
            return Err(transient(
                phase,
                Some(status.as_u16()),
                format!("server replied: {}", status),
            ));
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = format!("server replied: {} {}", status, text.trim());
            return Err(match phase {
                Phase::Write => Error::rejected(Some(status.as_u16()), reason),
                Phase::Read => Error::Transport {
                    status: Some(status.as_u16()),
                    reason,
                },
            });
        }

        let body: GraphqlResponse<T> = response.json().await.map_err(|e| Error::Transport {
            status: Some(status.as_u16()),
            reason: format!("invalid response body: {}", e),
        })?;

        if !body.errors.is_empty() {
            let reasons: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            warn!("GraphQL call returned errors: {:?}", reasons);
            return Err(match phase {
                Phase::Write => Error::WriteRejected {
                    status: Some(status.as_u16()),
                    reasons,
                },
                Phase::Read => Error::Transport {
                    status: Some(status.as_u16()),
                    reason: reasons.join("; "),
                },
            });
        }

        Ok(body.data)
    }

    async fn expect_data<T: DeserializeOwned>(
        &self,
        phase: Phase,
        query: &str,
        variables: Value,
    ) -> Result<T> {
        self.execute(phase, query, variables)
            .await?
            .ok_or_else(|| Error::Transport {
                status: None,
                reason: "response carried no data".to_string(),
            })
    }

    async fn list_all<D, T>(&self, query: &str, items: impl Fn(D) -> Page<T>) -> Result<Vec<T>>
    where
        D: DeserializeOwned,
    {
        let mut all = Vec::new();
        let mut next_token: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let variables = json!({ "limit": PAGE_SIZE, "nextToken": next_token });
            let page = items(self.expect_data::<D>(Phase::Read, query, variables).await?);
            all.extend(page.items);

            match page.next_token {
                Some(token) if !seen.insert(token.clone()) => {
                    return Err(Error::Transport {
                        status: None,
                        reason: format!("pagination token {} repeated", token),
                    });
                }
                Some(token) => next_token = Some(token),
                None => return Ok(all),
            }
        }
    }
}

fn transient(phase: Phase, status: Option<u16>, reason: String) -> Error {
    match phase {
        Phase::Read => Error::TransientLookup { status, reason },
        Phase::Write => Error::TransientWrite { status, reason },
    }
}

fn request_error(phase: Phase, err: reqwest::Error) -> Error {
    let status = err.status().map(|s| s.as_u16());
    if err.is_timeout() || err.is_connect() {
        transient(phase, status, err.to_string())
    } else {
        Error::Transport {
            status,
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl OwnerResolver for GraphqlClient {
    async fn resolve_owner(&self, device_id: &str) -> Result<String> {
        let data: GetDeviceData = self
            .expect_data(
                Phase::Read,
                GET_DEVICE_QUERY,
                json!({ "device_id": device_id }),
            )
            .await?;

        data.get_devices
            .map(|device| device.owner)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
    }
}

#[async_trait]
impl TelemetryWriter for GraphqlClient {
    async fn write_telemetry(&self, reading: &TelemetryReading) -> Result<TelemetryReading> {
        let data: CreateTelemetryData = self
            .expect_data(
                Phase::Write,
                CREATE_TELEMETRY_MUTATION,
                json!({ "input": reading }),
            )
            .await?;

        data.create_telemetry.ok_or_else(|| Error::Transport {
            status: None,
            reason: "createTelemetry returned no record".to_string(),
        })
    }
}

#[async_trait]
impl TelemetryReader for GraphqlClient {
    async fn get_telemetry(
        &self,
        device_id: &str,
        timestamp: i64,
    ) -> Result<Option<TelemetryReading>> {
        let data: GetTelemetryData = self
            .expect_data(
                Phase::Read,
                GET_TELEMETRY_QUERY,
                json!({ "device_id": device_id, "timestamp": timestamp }),
            )
            .await?;

        Ok(data.get_telemetry)
    }
}

#[async_trait]
impl DeviceStatusWriter for GraphqlClient {
    async fn update_status(&self, update: &DeviceStatusUpdate) -> Result<Device> {
        let data: UpdateDeviceData = self
            .expect_data(
                Phase::Write,
                UPDATE_DEVICE_MUTATION,
                json!({ "input": update }),
            )
            .await?;

        data.update_devices.ok_or_else(|| {
            Error::rejected(None, format!("Device {} was not updated", update.device_id))
        })
    }
}

#[async_trait]
impl DeviceRegistry for GraphqlClient {
    async fn register_device(&self, device_id: &str, owner: &str) -> Result<Device> {
        let data: CreateDeviceData = self
            .expect_data(
                Phase::Write,
                CREATE_DEVICE_MUTATION,
                json!({ "input": { "device_id": device_id, "owner": owner } }),
            )
            .await?;

        data.create_devices.ok_or_else(|| {
            Error::rejected(None, format!("Device {} was not created", device_id))
        })
    }

    async fn delete_device(&self, device_id: &str) -> Result<Option<Device>> {
        let data: DeleteDeviceData = self
            .expect_data(
                Phase::Write,
                DELETE_DEVICE_MUTATION,
                json!({ "input": { "device_id": device_id } }),
            )
            .await?;

        Ok(data.delete_devices)
    }

    async fn delete_telemetry(
        &self,
        device_id: &str,
        timestamp: i64,
    ) -> Result<Option<TelemetryReading>> {
        let data: DeleteTelemetryData = self
            .expect_data(
                Phase::Write,
                DELETE_TELEMETRY_MUTATION,
                json!({ "input": { "device_id": device_id, "timestamp": timestamp } }),
            )
            .await?;

        Ok(data.delete_telemetry)
    }
}

#[async_trait]
impl SnapshotSource for GraphqlClient {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.list_all(LIST_DEVICES_QUERY, |data: ListDevicesData| data.list_devices)
            .await
    }

    async fn list_telemetry(&self) -> Result<Vec<TelemetryReading>> {
        self.list_all(LIST_TELEMETRY_QUERY, |data: ListTelemetryData| {
            data.list_telemetries
        })
        .await
    }
}
