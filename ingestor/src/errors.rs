use crate::model::ErrorEntry;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The device is not registered. Readings for it are dropped, not failed.
    #[error("Device {0} is not registered")]
    DeviceNotFound(String),

    #[error("Owner lookup failed: {reason}")]
    TransientLookup { status: Option<u16>, reason: String },

    #[error("Write failed: {reason}")]
    TransientWrite { status: Option<u16>, reason: String },

    #[error("Write rejected: {}", .reasons.join("; "))]
    WriteRejected {
        status: Option<u16>,
        reasons: Vec<String>,
    },

    #[error("Transport error: {reason}")]
    Transport { status: Option<u16>, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    pub fn rejected(status: Option<u16>, reason: impl Into<String>) -> Self {
        Error::WriteRejected {
            status,
            reasons: vec![reason.into()],
        }
    }

    /// Failures that may succeed if the whole unit of work is attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientLookup { .. } | Error::TransientWrite { .. }
        )
    }

    /// HTTP status observed on the remote call that produced this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::TransientLookup { status, .. }
            | Error::TransientWrite { status, .. }
            | Error::WriteRejected { status, .. }
            | Error::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Structured error list carried in a failed response body.
    pub fn entries(&self) -> Vec<ErrorEntry> {
        let status = self.http_status();
        match self {
            Error::WriteRejected { reasons, .. } if !reasons.is_empty() => reasons
                .iter()
                .map(|reason| ErrorEntry {
                    status,
                    error: reason.clone(),
                })
                .collect(),
            _ => vec![ErrorEntry {
                status,
                error: self.to_string(),
            }],
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientLookup {
            status: Some(503),
            reason: "unavailable".to_string()
        }
        .is_transient());
        assert!(Error::TransientWrite {
            status: None,
            reason: "timeout".to_string()
        }
        .is_transient());
        assert!(!Error::rejected(None, "duplicate").is_transient());
        assert!(!Error::DeviceNotFound("d1".to_string()).is_transient());
    }

    #[test]
    fn test_rejection_yields_one_entry_per_reason() {
        let err = Error::WriteRejected {
            status: Some(200),
            reasons: vec!["bad temperature".to_string(), "bad owner".to_string()],
        };

        let entries = err.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, Some(200));
        assert_eq!(entries[1].error, "bad owner");
    }

    #[test]
    fn test_transport_entry_carries_rendered_cause() {
        let err = Error::Transport {
            status: None,
            reason: "connection reset".to_string(),
        };

        let entries = err.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, None);
        assert_eq!(entries[0].error, "Transport error: connection reset");
    }
}
