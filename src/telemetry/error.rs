//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur while shipping telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to connect to syslog.
    #[error("Failed to connect to syslog: {0}")]
    SyslogConnection(String),

    /// Failed to send a batch.
    #[error("Failed to send telemetry: {0}")]
    SendError(String),

    /// Failed to serialize an event to JSON.
    #[error("Failed to serialize event: {0}")]
    SerializationError(#[from] serde_json::Error),
}
