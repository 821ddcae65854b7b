use crate::errors::{Error, Result};
use crate::metrics::INVALID_MESSAGES_TOTAL;
use crate::model::{ConnectivityEvent, IngestResponse, RawReading};
use crate::pipeline::{Outcome, Pipeline};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::future::Future;
use tracing::{debug, error, info, warn};

pub const TELEMETRY_TOPIC: &str = "telemetry/#";
pub const STATUS_TOPIC: &str = "status/#";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// A decoded device message.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Telemetry(RawReading),
    Status(ConnectivityEvent),
}

/// Decodes a publish into a trigger, based on the topic it arrived on.
pub fn decode(topic: &str, payload: &[u8]) -> Result<Trigger> {
    if topic.starts_with("telemetry/") {
        Ok(Trigger::Telemetry(serde_json::from_slice(payload)?))
    } else if topic.starts_with("status/") {
        Ok(Trigger::Status(serde_json::from_slice(payload)?))
    } else {
        Err(Error::Validation(format!("Unexpected topic {}", topic)))
    }
}

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    pipeline: Pipeline,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    for topic in [TELEMETRY_TOPIC, STATUS_TOPIC] {
        client.subscribe(topic, QoS::AtLeastOnce).await?;
        info!("Subscribed to {} with QoS 1", topic);
    }

    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    let trigger = match decode(&publish.topic, &publish.payload) {
                        Ok(trigger) => trigger,
                        Err(e) => {
                            warn!("Discarding message on {}: {}", publish.topic, e);
                            INVALID_MESSAGES_TOTAL.inc();
                            continue;
                        }
                    };

                    // Each trigger is its own unit of work
                    let pipeline = pipeline.clone();
                    tokio::spawn(async move {
                        let response = dispatch(&pipeline, trigger).await;
                        debug!("Trigger answered with {}", response.status_code);
                    });
                }
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc automatically reconnects, so we just log and continue
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Runs a trigger through the pipeline, retrying the whole unit of work on
/// transient failures.
pub async fn dispatch(pipeline: &Pipeline, trigger: Trigger) -> IngestResponse {
    match trigger {
        Trigger::Telemetry(raw) => {
            let pipeline = pipeline.clone();
            with_retry(move || {
                let pipeline = pipeline.clone();
                let raw = raw.clone();
                async move { pipeline.ingest_telemetry(raw).await }
            })
            .await
            .into_response()
        }
        Trigger::Status(event) => {
            let pipeline = pipeline.clone();
            with_retry(move || {
                let pipeline = pipeline.clone();
                let event = event.clone();
                async move { pipeline.ingest_status(event).await }
            })
            .await
            .into_response()
        }
    }
}

/// Repeats `attempt` with exponential backoff while it fails transiently
async fn with_retry<T, F, Fut>(mut attempt: F) -> Outcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T>>,
{
    let mut tries = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        tries += 1;

        match attempt().await {
            Outcome::Failed(e) if e.is_transient() && tries < MAX_RETRIES => {
                warn!(
                    "Ingestion failed (attempt {}/{}): {}. Retrying in {}ms...",
                    tries, MAX_RETRIES, e, backoff_ms
                );

                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
            outcome => {
                if tries > 1 && outcome.is_success() {
                    info!("Ingestion succeeded on attempt {}", tries);
                }
                return outcome;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_decode_telemetry() {
        let payload = br#"{"device_id":"d1","temperature":22.5,"timestamp":1000}"#;

        match decode("telemetry/d1", payload).unwrap() {
            Trigger::Telemetry(raw) => {
                assert_eq!(raw.device_id, "d1");
                assert_eq!(raw.humidity, None);
            }
            other => panic!("unexpected trigger: {other:?}"),
        }
    }

    #[test]
    fn test_decode_status() {
        let payload = br#"{"device_id":"d1","eventType":"disconnected"}"#;

        assert!(matches!(
            decode("status/d1", payload).unwrap(),
            Trigger::Status(event) if event.event_type == "disconnected"
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode("telemetry/d1", b"invalid json"),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            decode("firmware/d1", b"{}"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_transient_failures_are_retried() {
        tokio_test::block_on(async {
            let attempts = Arc::new(AtomicU32::new(0));
            let counter = attempts.clone();

            let outcome = with_retry(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Outcome::Failed(Error::TransientWrite {
                            status: None,
                            reason: "timeout".to_string(),
                        })
                    } else {
                        Outcome::Written(())
                    }
                }
            })
            .await;

            assert!(matches!(outcome, Outcome::Written(())));
            assert_eq!(attempts.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn test_rejections_are_not_retried() {
        tokio_test::block_on(async {
            let attempts = Arc::new(AtomicU32::new(0));
            let counter = attempts.clone();

            let outcome: Outcome<()> = with_retry(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::Failed(Error::rejected(None, "duplicate"))
                }
            })
            .await;

            assert!(!outcome.is_success());
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_dispatch_writes_reading() {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            store.seed_device("d1", "u1").await;
            let pipeline = Pipeline::new(store.clone(), store.clone(), store.clone());
            let payload =
                br#"{"device_id":"d1","temperature":22.5,"humidity":55,"timestamp":1000}"#;

            let trigger = decode("telemetry/d1", payload).unwrap();
            let response = dispatch(&pipeline, trigger).await;

            assert_eq!(response.status_code, 200);
            assert_eq!(response.body["owner"], "u1");
            assert_eq!(store.telemetry_count().await, 1);
        });
    }
}
