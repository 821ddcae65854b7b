mod telemetry;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::{Duration, Instant};
use telemetry::{generate_reading, ConnectivityEvent};
use tracing::{error, info, warn};

/// Publishes simulated temperature/humidity telemetry for a device fleet.
#[derive(Debug, Parser)]
#[command(name = "telemetry-simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    /// Seconds between two readings of the same device
    #[arg(long, env = "PERIOD_SECS", default_value_t = 3)]
    period_secs: u64,

    #[arg(long, env = "DEVICES", default_value_t = 5)]
    devices: usize,

    /// Prefix of simulated device ids
    #[arg(long, env = "DEVICE_PREFIX", default_value = "dev")]
    device_prefix: String,

    /// Chance per period that a device drops off the network
    #[arg(long, env = "DROPOUT_CHANCE", default_value_t = 0.01)]
    dropout_chance: f64,

    /// How long a dropped device stays silent
    #[arg(long, env = "DROPOUT_SECS", default_value_t = 120)]
    dropout_secs: u64,
}

struct SimulatedDevice {
    id: String,
    silent_until: Option<Instant>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting IoT Simulator");
    info!(
        "Broker: {}:{}, Devices: {}, Period: {}s",
        args.mqtt_broker, args.mqtt_port, args.devices, args.period_secs
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.mqtt_broker, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    // Spawn eventloop handler
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut fleet: Vec<SimulatedDevice> = (0..args.devices)
        .map(|i| SimulatedDevice {
            id: format!("{}-{}", args.device_prefix, i),
            silent_until: None,
        })
        .collect();

    for device in &fleet {
        publish(&client, "status", &device.id, &ConnectivityEvent::connected(&device.id)).await;
    }

    info!("Connected to MQTT broker, starting to publish telemetry");

    let mut rng = rand::thread_rng();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.period_secs.max(1)));
    let mut published = 0u64;

    loop {
        ticker.tick().await;
        let now = Instant::now();

        for device in fleet.iter_mut() {
            match device.silent_until {
                Some(until) if now < until => continue,
                Some(_) => {
                    info!("Device {} is back online", device.id);
                    device.silent_until = None;
                    let event = ConnectivityEvent::connected(&device.id);
                    publish(&client, "status", &device.id, &event).await;
                }
                None => {}
            }

            if rng.gen_bool(args.dropout_chance.clamp(0.0, 1.0)) {
                info!(
                    "Device {} drops off for {}s",
                    device.id, args.dropout_secs
                );
                device.silent_until = Some(now + Duration::from_secs(args.dropout_secs));
                // Half of the dropouts are clean disconnects, the rest just go quiet
                if rng.gen_bool(0.5) {
                    let event = ConnectivityEvent::disconnected(&device.id);
                    publish(&client, "status", &device.id, &event).await;
                }
                continue;
            }

            let timestamp = Utc::now().timestamp_millis();
            let reading = generate_reading(&mut rng, device.id.clone(), timestamp);
            if publish(&client, "telemetry", &device.id, &reading).await {
                published += 1;
            }
        }

        // Log progress periodically
        if published > 0 && published % 100 == 0 {
            info!("Published {} readings", published);
        }
    }
}

async fn publish<T: Serialize>(
    client: &AsyncClient,
    prefix: &str,
    device_id: &str,
    payload: &T,
) -> bool {
    let topic = format!("{}/{}", prefix, device_id);
    let payload = match serde_json::to_vec(payload) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize payload for {}: {}", topic, e);
            return false;
        }
    };

    match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to publish to {}: {}", topic, e);
            false
        }
    }
}
