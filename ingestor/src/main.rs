use anyhow::Context;
use axum::{routing::get, Router};
use std::sync::Arc;
use telemetry_ingestor::config::{BackendKind, Config};
use telemetry_ingestor::db::{self, PgStore};
use telemetry_ingestor::graphql::GraphqlClient;
use telemetry_ingestor::memory::MemoryStore;
use telemetry_ingestor::metrics;
use telemetry_ingestor::monitor::LivenessMonitor;
use telemetry_ingestor::mqtt;
use telemetry_ingestor::pipeline::Pipeline;
use telemetry_ingestor::rest;
use telemetry_ingestor::store::Collaborators;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting IoT telemetry ingestor");
    info!("Backend: {:?}", config.backend);
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Liveness: stale after {:?}, evaluated every {:?}",
        config.stale_threshold, config.monitor_interval
    );

    // Initialize metrics
    metrics::init_metrics();

    let collaborators = match connect_backend(&config).await {
        Ok(collaborators) => collaborators,
        Err(e) => {
            error!("Failed to set up {:?} backend: {:#}", config.backend, e);
            std::process::exit(1);
        }
    };

    let pipeline = Pipeline::new(
        collaborators.resolver.clone(),
        collaborators.writer.clone(),
        collaborators.devices.clone(),
    );

    // Spawn liveness monitor
    let (monitor, monitor_handle) = LivenessMonitor::new(
        collaborators.source.clone(),
        collaborators.devices.clone(),
        config.stale_threshold,
    );
    let monitor_task = tokio::spawn(monitor.run(config.monitor_interval));

    // Generate client ID
    let client_id = format!("ingestor-{}", uuid::Uuid::new_v4());
    let mqtt_pipeline = pipeline.clone();
    let mqtt_broker = config.mqtt_broker.clone();
    let mqtt_port = config.mqtt_port;
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(mqtt_broker, mqtt_port, client_id, mqtt_pipeline).await {
            error!("MQTT task failed: {}", e);
        }
    });

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .merge(rest::create_router(
            pipeline,
            collaborators.reader.clone(),
            collaborators.registry.clone(),
            monitor_handle,
        ));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = monitor_task => {
            error!("Liveness monitor terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn connect_backend(config: &Config) -> anyhow::Result<Collaborators> {
    match config.backend {
        BackendKind::Graphql => {
            let endpoint = config
                .api_endpoint
                .clone()
                .context("API_ENDPOINT is not set")?;
            let api_key = config.api_key.clone().context("API_KEY is not set")?;
            let client = GraphqlClient::new(endpoint, api_key, config.request_timeout)?;
            Ok(Collaborators::from_backend(Arc::new(client)))
        }
        BackendKind::Postgres => {
            info!("Database: {}", config.database_host());
            let pool = db::make_pool(&config.database_url)
                .await
                .context("Failed to connect to database")?;
            Ok(Collaborators::from_backend(Arc::new(PgStore::new(pool))))
        }
        BackendKind::Memory => {
            warn!("Using the in-memory backend; nothing survives a restart");
            let store = MemoryStore::new();
            for (device_id, owner) in &config.seed_devices {
                store.seed_device(device_id, owner).await;
                info!("Registered device {} for {}", device_id, owner);
            }
            Ok(Collaborators::from_backend(Arc::new(store)))
        }
    }
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn health_handler() -> &'static str {
    "ok"
}
