use crate::errors::{Error, Result};
use crate::model::{ConnectivityEvent, DeviceRegistration, DeviceStatus, RawReading};

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;

/// Validates a raw reading before any remote call is made
pub fn validate_reading(reading: &RawReading) -> Result<()> {
    validate_device_id(&reading.device_id)?;

    if reading.timestamp < 0 {
        return Err(Error::Validation(format!(
            "Timestamp {} is negative",
            reading.timestamp
        )));
    }

    if let Some(temperature) = reading.temperature {
        check_range("Temperature", temperature, TEMP_MIN, TEMP_MAX)?;
    }

    if let Some(humidity) = reading.humidity {
        check_range("Humidity", humidity, HUMIDITY_MIN, HUMIDITY_MAX)?;
    }

    Ok(())
}

/// Validates a connectivity event and returns the status it maps to
pub fn validate_event(event: &ConnectivityEvent) -> Result<DeviceStatus> {
    validate_device_id(&event.device_id)?;

    event.status().ok_or_else(|| {
        Error::Validation(format!("Unknown event type '{}'", event.event_type))
    })
}

pub fn validate_registration(registration: &DeviceRegistration) -> Result<()> {
    validate_device_id(&registration.device_id)?;

    if registration.owner.trim().is_empty() {
        return Err(Error::Validation("Owner cannot be empty".to_string()));
    }
    Ok(())
}

fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }
    Ok(())
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(Error::Validation(format!(
            "{} {} out of range [{}, {}]",
            name, value, min, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(temperature: Option<f64>, humidity: Option<f64>) -> RawReading {
        RawReading {
            device_id: "dev-1".to_string(),
            temperature,
            humidity,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_valid_reading() {
        assert!(validate_reading(&reading(Some(25.0), Some(60.0))).is_ok());
    }

    #[test]
    fn test_partial_reading_is_valid() {
        assert!(validate_reading(&reading(None, Some(60.0))).is_ok());
        assert!(validate_reading(&reading(None, None)).is_ok());
    }

    #[test]
    fn test_invalid_temperature() {
        assert!(validate_reading(&reading(Some(150.0), Some(60.0))).is_err());
        assert!(validate_reading(&reading(Some(f64::NAN), None)).is_err());
    }

    #[test]
    fn test_invalid_humidity() {
        assert!(validate_reading(&reading(Some(25.0), Some(150.0))).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        let mut raw = reading(Some(25.0), Some(60.0));
        raw.device_id = "".to_string();

        assert!(matches!(validate_reading(&raw), Err(Error::Validation(_))));
    }

    #[test]
    fn test_negative_timestamp() {
        let mut raw = reading(Some(25.0), Some(60.0));
        raw.timestamp = -1;

        assert!(validate_reading(&raw).is_err());
    }

    #[test]
    fn test_event_validation() {
        let connected = ConnectivityEvent {
            device_id: "dev-1".to_string(),
            event_type: "connected".to_string(),
        };
        let bogus = ConnectivityEvent {
            device_id: "dev-1".to_string(),
            event_type: "exploded".to_string(),
        };

        assert_eq!(validate_event(&connected).unwrap(), DeviceStatus::Online);
        assert!(validate_event(&bogus).is_err());
    }

    #[test]
    fn test_registration_needs_owner() {
        let mut registration = DeviceRegistration {
            device_id: "dev-1".to_string(),
            owner: "u1".to_string(),
        };
        assert!(validate_registration(&registration).is_ok());

        registration.owner = " ".to_string();
        assert!(matches!(
            validate_registration(&registration),
            Err(Error::Validation(_))
        ));
    }
}
