use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{Device, DeviceStatus, DeviceStatusUpdate, TelemetryReading};
use crate::store::{
    DeviceRegistry, DeviceStatusWriter, OwnerResolver, SnapshotSource, TelemetryReader,
    TelemetryWriter,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

const UNIQUE_VIOLATION: &str = "23505";

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    owner: String,
    status: Option<String>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            device_id: row.device_id,
            owner: row.owner,
            status: DeviceStatus::from_stored(row.status.as_deref()),
        }
    }
}

/// Device registry and telemetry tables in Postgres.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OwnerResolver for PgStore {
    async fn resolve_owner(&self, device_id: &str) -> Result<String> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT owner FROM devices WHERE device_id = $1")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(lookup_error)?;

        owner.ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
    }
}

#[async_trait]
impl TelemetryWriter for PgStore {
    async fn write_telemetry(&self, reading: &TelemetryReading) -> Result<TelemetryReading> {
        let query = r#"
            INSERT INTO telemetry (device_id, ts, temperature, humidity, owner)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING device_id, ts AS timestamp, temperature, humidity, owner
            "#;

        sqlx::query_as::<_, TelemetryReading>(query)
            .bind(&reading.device_id)
            .bind(reading.timestamp)
            .bind(reading.temperature)
            .bind(reading.humidity)
            .bind(&reading.owner)
            .fetch_one(&self.pool)
            .await
            .map_err(write_error)
    }
}

#[async_trait]
impl TelemetryReader for PgStore {
    async fn get_telemetry(
        &self,
        device_id: &str,
        timestamp: i64,
    ) -> Result<Option<TelemetryReading>> {
        sqlx::query_as::<_, TelemetryReading>(
            "SELECT device_id, ts AS timestamp, temperature, humidity, owner
             FROM telemetry WHERE device_id = $1 AND ts = $2",
        )
        .bind(device_id)
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await
        .map_err(lookup_error)
    }
}

#[async_trait]
impl DeviceStatusWriter for PgStore {
    async fn update_status(&self, update: &DeviceStatusUpdate) -> Result<Device> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "UPDATE devices SET status = $2, updated_at = now()
             WHERE device_id = $1
             RETURNING device_id, owner, status",
        )
        .bind(&update.device_id)
        .bind(update.status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(write_error)?;

        row.map(Device::from).ok_or_else(|| {
            Error::rejected(None, format!("Device {} does not exist", update.device_id))
        })
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    async fn register_device(&self, device_id: &str, owner: &str) -> Result<Device> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "INSERT INTO devices (device_id, owner) VALUES ($1, $2)
             RETURNING device_id, owner, status",
        )
        .bind(device_id)
        .bind(owner)
        .fetch_one(&self.pool)
        .await
        .map_err(write_error)?;

        info!("Registered device {} for {}", device_id, owner);
        Ok(Device::from(row))
    }

    async fn delete_device(&self, device_id: &str) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "DELETE FROM devices WHERE device_id = $1
             RETURNING device_id, owner, status",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(write_error)?;

        Ok(row.map(Device::from))
    }

    async fn delete_telemetry(
        &self,
        device_id: &str,
        timestamp: i64,
    ) -> Result<Option<TelemetryReading>> {
        sqlx::query_as::<_, TelemetryReading>(
            "DELETE FROM telemetry WHERE device_id = $1 AND ts = $2
             RETURNING device_id, ts AS timestamp, temperature, humidity, owner",
        )
        .bind(device_id)
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await
        .map_err(write_error)
    }
}

#[async_trait]
impl SnapshotSource for PgStore {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, owner, status FROM devices ORDER BY device_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(lookup_error)?;

        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn list_telemetry(&self) -> Result<Vec<TelemetryReading>> {
        sqlx::query_as::<_, TelemetryReading>(
            "SELECT device_id, ts AS timestamp, temperature, humidity, owner
             FROM telemetry ORDER BY ts",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(lookup_error)
    }
}

fn lookup_error(err: sqlx::Error) -> Error {
    if is_transient_error(&err) {
        DB_FAILURES_TOTAL.inc();
        warn!("Transient database error on read: {}", err);
        Error::TransientLookup {
            status: None,
            reason: err.to_string(),
        }
    } else {
        error!("Database read failed: {}", err);
        Error::Transport {
            status: None,
            reason: err.to_string(),
        }
    }
}

fn write_error(err: sqlx::Error) -> Error {
    if is_transient_error(&err) {
        DB_FAILURES_TOTAL.inc();
        warn!("Transient database error on write: {}", err);
        return Error::TransientWrite {
            status: None,
            reason: err.to_string(),
        };
    }

    match &err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                Error::rejected(None, "A record with this key already exists")
            } else {
                Error::rejected(None, db_err.message().to_string())
            }
        }
        _ => {
            error!("Database write failed: {}", err);
            Error::Transport {
                status: None,
                reason: err.to_string(),
            }
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient_write() {
        let err = write_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::TransientWrite { .. }));
    }

    #[test]
    fn test_pool_closed_is_transient_lookup() {
        let err = lookup_error(sqlx::Error::PoolClosed);
        assert!(matches!(err, Error::TransientLookup { .. }));
    }

    #[test]
    fn test_missing_row_is_not_transient() {
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
        assert!(matches!(
            lookup_error(sqlx::Error::RowNotFound),
            Error::Transport { .. }
        ));
    }
}
