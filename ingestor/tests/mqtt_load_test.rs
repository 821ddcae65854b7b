//! Load tests against a broker on localhost:1883 with the ingestor attached.
//! Run with `cargo test -- --ignored`.

use chrono::Utc;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::{Duration, Instant};
use telemetry_ingestor::model::{ConnectivityEvent, RawReading};
use tokio::time::sleep;

fn random_reading(device_id: String) -> RawReading {
    let mut rng = rand::thread_rng();
    RawReading {
        device_id,
        temperature: Some(rng.gen_range(15.0..35.0)),
        humidity: rng.gen_bool(0.9).then(|| rng.gen_range(30.0..80.0)),
        timestamp: Utc::now().timestamp_millis(),
    }
}

async fn connect(client_id: &str) -> AsyncClient {
    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;
    client
}

#[tokio::test]
#[ignore]
async fn test_1000_readings_per_second() {
    let test_duration_secs: usize = 10;
    let target_rate: usize = 1000;
    let total_messages = test_duration_secs * target_rate;
    let devices: usize = 10;

    let client = connect("load-test").await;

    for i in 0..devices {
        let event = ConnectivityEvent {
            device_id: format!("load-test-dev-{}", i),
            event_type: "connected".to_string(),
        };
        client
            .publish(
                format!("status/{}", event.device_id),
                QoS::AtLeastOnce,
                false,
                serde_json::to_vec(&event).unwrap(),
            )
            .await
            .unwrap();
    }

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    let burst_size: usize = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000 / target_rate) as u64);

    for batch_start in (0..total_messages).step_by(burst_size) {
        let batch_end = std::cmp::min(batch_start + burst_size, total_messages);
        for i in batch_start..batch_end {
            let device_id = format!("load-test-dev-{}", i % devices);
            let payload = serde_json::to_vec(&random_reading(device_id.clone())).unwrap();

            match client
                .publish(
                    format!("telemetry/{}", device_id),
                    QoS::AtLeastOnce,
                    false,
                    payload,
                )
                .await
            {
                Ok(_) => sent_count += 1,
                Err(e) => {
                    error_count += 1;
                    if error_count < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;
    }

    let duration = start.elapsed();
    let actual_rate = sent_count as f64 / duration.as_secs_f64();
    println!(
        "Sent {} readings in {:.2}s ({:.0} msg/s), {} errors",
        sent_count,
        duration.as_secs_f64(),
        actual_rate,
        error_count
    );

    assert!(
        actual_rate >= 900.0,
        "Throughput too low: {:.2} msg/s (expected >= 900)",
        actual_rate
    );
    assert_eq!(error_count, 0, "Publish errors: {}", error_count);
}
