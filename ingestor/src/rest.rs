use crate::errors::Error;
use crate::model::{
    ConnectivityEvent, DeviceRegistration, DeviceSummary, IngestResponse, Notification,
    RawReading, TelemetryReading,
};
use crate::monitor::MonitorHandle;
use crate::pipeline::{Outcome, Pipeline};
use crate::store::{DeviceRegistry, TelemetryReader};
use crate::validate::validate_registration;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    reader: Arc<dyn TelemetryReader>,
    registry: Arc<dyn DeviceRegistry>,
    monitor: MonitorHandle,
}

/// Identity supplied by the auth layer in front of the read API.
#[derive(Debug, Default, Deserialize)]
struct OwnerFilter {
    owner: Option<String>,
}

impl OwnerFilter {
    fn admits(&self, owner: &str) -> bool {
        self.owner.as_deref().map_or(true, |wanted| wanted == owner)
    }
}

pub fn create_router(
    pipeline: Pipeline,
    reader: Arc<dyn TelemetryReader>,
    registry: Arc<dyn DeviceRegistry>,
    monitor: MonitorHandle,
) -> Router {
    let state = AppState {
        pipeline,
        reader,
        registry,
        monitor,
    };

    Router::new()
        .route("/api/v1/ingest/telemetry", post(ingest_telemetry))
        .route("/api/v1/ingest/status", post(ingest_status))
        .route(
            "/api/v1/telemetry/:device_id/:timestamp",
            get(get_telemetry).delete(delete_telemetry),
        )
        .route("/api/v1/devices", get(list_devices).post(register_device))
        .route("/api/v1/devices/:device_id", delete(delete_device))
        .route("/api/v1/notifications", get(list_notifications))
        .route("/api/v1/notifications/:id", delete(dismiss_notification))
        .with_state(state)
}

impl IntoResponse for IngestResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_REQUEST);
        (status, Json(self)).into_response()
    }
}

async fn ingest_telemetry(
    State(state): State<AppState>,
    payload: Result<Json<RawReading>, JsonRejection>,
) -> IngestResponse {
    match payload {
        Ok(Json(raw)) => state.pipeline.ingest_telemetry(raw).await.into_response(),
        Err(rejection) => malformed::<TelemetryReading>(rejection),
    }
}

async fn ingest_status(
    State(state): State<AppState>,
    payload: Result<Json<ConnectivityEvent>, JsonRejection>,
) -> IngestResponse {
    match payload {
        Ok(Json(event)) => state.pipeline.ingest_status(event).await.into_response(),
        Err(rejection) => malformed::<crate::model::Device>(rejection),
    }
}

fn malformed<T: serde::Serialize>(rejection: JsonRejection) -> IngestResponse {
    Outcome::<T>::Failed(Error::Validation(rejection.body_text())).into_response()
}

async fn get_telemetry(
    State(state): State<AppState>,
    Path((device_id, timestamp)): Path<(String, i64)>,
) -> Result<Response, AppError> {
    let reading = state.reader.get_telemetry(&device_id, timestamp).await?;

    Ok(match reading {
        Some(reading) => Json(reading).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

async fn delete_telemetry(
    State(state): State<AppState>,
    Path((device_id, timestamp)): Path<(String, i64)>,
) -> Response {
    match state.registry.delete_telemetry(&device_id, timestamp).await {
        Ok(Some(_)) => {
            info!("Deleted reading {}@{}", device_id, timestamp);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => registry_error(e),
    }
}

async fn register_device(
    State(state): State<AppState>,
    payload: Result<Json<DeviceRegistration>, JsonRejection>,
) -> Response {
    let registration = match payload {
        Ok(Json(registration)) => registration,
        Err(rejection) => return registry_error(Error::Validation(rejection.body_text())),
    };

    if let Err(e) = validate_registration(&registration) {
        return registry_error(e);
    }

    match state
        .registry
        .register_device(&registration.device_id, &registration.owner)
        .await
    {
        Ok(device) => {
            info!("Registered device {} for {}", device.device_id, device.owner);
            (StatusCode::CREATED, Json(device)).into_response()
        }
        Err(e) => registry_error(e),
    }
}

async fn delete_device(State(state): State<AppState>, Path(device_id): Path<String>) -> Response {
    match state.registry.delete_device(&device_id).await {
        Ok(Some(_)) => {
            info!("Deleted device {}", device_id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => registry_error(e),
    }
}

fn registry_error(err: Error) -> Response {
    let status = match &err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::WriteRejected { .. } => StatusCode::CONFLICT,
        Error::TransientLookup { .. } | Error::TransientWrite { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Transport { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("Registry request failed with {}: {}", status, err);

    (status, Json(json!({ "errors": err.entries() }))).into_response()
}

async fn list_devices(
    State(state): State<AppState>,
    Query(filter): Query<OwnerFilter>,
) -> Json<Vec<DeviceSummary>> {
    let devices = state.monitor.devices();
    Json(devices.into_iter().filter(|d| filter.admits(&d.owner)).collect())
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(filter): Query<OwnerFilter>,
) -> Json<Vec<Notification>> {
    let notifications = state.monitor.notifications();
    Json(notifications.into_iter().filter(|n| filter.admits(&n.owner)).collect())
}

async fn dismiss_notification(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, AppError> {
    if state.monitor.dismiss(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
