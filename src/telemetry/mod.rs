//! Fleet telemetry.
//!
//! Security signals (secret detections, new-domain decisions, rate limit
//! hits) are reported as structured events to an external aggregation
//! service. This is separate from both diagnostic logging (`tracing` on
//! stderr) and the local hash-chained audit ledger.
//!
//! # Event Format
//!
//! ```json
//! {"installationId":"9f2c...","eventType":"SECRET_DETECTED","domain":"api.example.test","secretType":"AWS Access Key","decision":"block","threatScore":55}
//! ```

mod error;
mod events;
mod reporter;
mod syslog;

pub use error::TelemetryError;
pub use events::{SENSITIVE_METADATA_KEYS, TelemetryEvent, TelemetryEventType, sanitize_metadata};
pub use reporter::{DEFAULT_BATCH_SIZE, MAX_REQUEUE_BUFFER, TelemetryReporter, installation_id};
pub use syslog::{NullSink, SYSLOG_TAG, SyslogSink, TelemetrySink};
