use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reading as published on `telemetry/<device_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    /// epoch milliseconds
    pub timestamp: i64,
}

/// Lifecycle event as published on `status/<device_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    pub device_id: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
}

impl ConnectivityEvent {
    pub fn connected(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            event_type: "connected".to_string(),
        }
    }

    pub fn disconnected(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            event_type: "disconnected".to_string(),
        }
    }
}

pub fn generate_reading(rng: &mut impl Rng, device_id: String, timestamp: i64) -> Reading {
    let temperature = if rng.gen_bool(0.03) {
        None // sensor glitch, partial reading
    } else {
        Some(rng.gen_range(20.0..30.0))
    };

    let humidity = if rng.gen_bool(0.03) {
        None
    } else {
        Some(rng.gen_range(40.0..90.0))
    };

    Reading {
        device_id,
        temperature,
        humidity,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_values_stay_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let reading = generate_reading(&mut rng, "dev-0".to_string(), 1);
            if let Some(t) = reading.temperature {
                assert!((20.0..30.0).contains(&t));
            }
            if let Some(h) = reading.humidity {
                assert!((40.0..90.0).contains(&h));
            }
        }
    }

    #[test]
    fn test_partial_reading_omits_fields() {
        let reading = Reading {
            device_id: "dev-0".to_string(),
            temperature: None,
            humidity: Some(50.0),
            timestamp: 1000,
        };

        let json = serde_json::to_value(&reading).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["humidity"], 50.0);
    }
}
