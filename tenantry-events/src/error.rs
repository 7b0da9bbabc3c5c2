//! Error types for event delivery

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EventError {
    /// Broker unreachable or connection dropped
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    /// Broker negatively acknowledged the message
    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Reading or updating the outbox failed
    #[error("Outbox error: {0}")]
    Outbox(String),
}

impl EventError {
    /// Whether redelivery may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EventError::Connection(_)
                | EventError::Publish(_)
                | EventError::Rejected(_)
                | EventError::Timeout(_)
                | EventError::Outbox(_)
        )
    }
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}

#[cfg(feature = "rabbitmq")]
impl From<lapin::Error> for EventError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
                EventError::Connection(err.to_string())
            }
            _ => EventError::Publish(err.to_string()),
        }
    }
}
