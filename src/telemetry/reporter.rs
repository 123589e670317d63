//! Buffered telemetry reporter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::events::{TelemetryEvent, sanitize_metadata};
use super::syslog::TelemetrySink;

/// Events per flush.
pub const DEFAULT_BATCH_SIZE: usize = 25;
/// Failed batches are requeued only while the buffer is below this size.
pub const MAX_REQUEUE_BUFFER: usize = 500;

/// Stable, non-reversible id for this machine and user.
pub fn installation_id() -> String {
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_default();
    let raw = format!(
        "{}-{}-{}-{}",
        host,
        user,
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Buffers sanitized events and flushes them through a sink in batches.
pub struct TelemetryReporter {
    sink: Arc<dyn TelemetrySink>,
    installation_id: String,
    batch_size: usize,
    enabled: bool,
    buffer: Mutex<VecDeque<TelemetryEvent>>,
}

impl TelemetryReporter {
    pub fn new(sink: Arc<dyn TelemetrySink>, batch_size: usize) -> Self {
        Self {
            sink,
            installation_id: installation_id(),
            batch_size: batch_size.max(1),
            enabled: true,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// A reporter that drops every event.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Arc::new(super::NullSink), DEFAULT_BATCH_SIZE)
        }
    }

    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Buffer an event, flushing when a full batch is waiting.
    pub fn report(&self, mut event: TelemetryEvent) {
        if !self.is_enabled() {
            return;
        }
        event.installation_id = self.installation_id.clone();
        event.metadata = sanitize_metadata(event.metadata.take());

        let full = {
            let mut buffer = self.buffer.lock();
            buffer.push_back(event);
            buffer.len() >= self.batch_size
        };
        if full {
            self.flush();
        }
    }

    /// Send one batch. A failed batch goes back to the front of the buffer
    /// unless the buffer is already large.
    pub fn flush(&self) {
        if !self.is_enabled() {
            return;
        }
        let batch: Vec<TelemetryEvent> = {
            let mut buffer = self.buffer.lock();
            let take = buffer.len().min(self.batch_size);
            buffer.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        match self.sink.send(&batch) {
            Ok(()) => debug!(events = batch.len(), "Flushed telemetry"),
            Err(e) => {
                let mut buffer = self.buffer.lock();
                if buffer.len() < MAX_REQUEUE_BUFFER {
                    for event in batch.into_iter().rev() {
                        buffer.push_front(event);
                    }
                }
                warn!(target: "rashomon::ops", error = %e, "Telemetry flush failed");
            }
        }
    }

    /// Number of events waiting to be sent.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Flush on a fixed interval until the task is aborted.
    pub fn spawn_flush_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reporter.flush();
            }
        })
    }
}

impl std::fmt::Debug for TelemetryReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryReporter")
            .field("enabled", &self.is_enabled())
            .field("pending", &self.pending())
            .finish()
    }
}
