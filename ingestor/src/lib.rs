//! Telemetry ingestion and device liveness for the IoT dashboard backend.
//!
//! Readings arrive over MQTT or HTTP, are attributed to the owner of their
//! device and written to the telemetry store. A liveness monitor watches the
//! store and flips devices online/offline as their readings go stale.

pub mod config;
pub mod db;
pub mod errors;
pub mod graphql;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod mqtt;
pub mod pipeline;
pub mod rest;
pub mod store;
pub mod validate;
