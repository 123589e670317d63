//! Telemetry sinks.
//!
//! The syslog sink writes one JSON line per event with the `RASHOMON` tag so
//! a local collector can forward them to fleet aggregation.

use parking_lot::Mutex;
use syslog::{Facility, Formatter3164};
use tracing::debug;

use super::error::TelemetryError;
use super::events::TelemetryEvent;

/// Syslog tag for telemetry events.
pub const SYSLOG_TAG: &str = "RASHOMON";

/// Destination for flushed telemetry batches.
pub trait TelemetrySink: Send + Sync {
    /// Deliver a batch. On error the caller requeues the batch.
    fn send(&self, batch: &[TelemetryEvent]) -> Result<(), TelemetryError>;
}

/// Writes events to the local syslog daemon.
pub struct SyslogSink {
    writer: Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>,
}

impl SyslogSink {
    /// Connect over the local Unix socket.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter)
            .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }
}

impl TelemetrySink for SyslogSink {
    fn send(&self, batch: &[TelemetryEvent]) -> Result<(), TelemetryError> {
        let mut writer = self.writer.lock();
        for event in batch {
            let json = serde_json::to_string(event)?;
            writer
                .info(&json)
                .map_err(|e| TelemetryError::SendError(e.to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyslogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyslogSink").finish_non_exhaustive()
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn send(&self, _batch: &[TelemetryEvent]) -> Result<(), TelemetryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryEventType;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "RASHOMON");
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        let batch = vec![TelemetryEvent::new(TelemetryEventType::RateLimitHit, "throttle")];
        assert!(NullSink.send(&batch).is_ok());
    }

    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_syslog_send() {
        let sink = SyslogSink::new().unwrap();
        let batch = vec![TelemetryEvent::new(TelemetryEventType::RateLimitHit, "throttle")];
        assert!(sink.send(&batch).is_ok());
    }
}
